//! Wire vocabulary: the signed envelope wrapping every cluster message and
//! the payload kinds the router dispatches on.
//!
//! ## Envelope
//!
//! ```text
//! { "sender": hex(pk32), "payload": { "type": ..., ... }, "signature": hex(sig64) }
//! ```
//!
//! The signature covers the canonical JSON bytes of `payload` alone, so a
//! relay cannot re-author a payload without the sender's key. Envelopes that
//! fail verification are dropped before they can touch consensus or the peer
//! registry.
//!
//! ## Canonicalization
//!
//! Canonical bytes are `serde_json::to_vec` of the payload struct. This is
//! deterministic because every payload type has a fixed field declaration
//! order and contains no unordered maps; signer and verifier therefore agree
//! bit-for-bit as long as they run the same type definitions.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::identity::{self, NodeIdentity};
use crate::ops::Operation;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("envelope JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("signature verification failed for sender {sender}")]
    BadSignature { sender: String },
}

/// Everything that travels between nodes.
///
/// The `type` tag on the wire uses the protocol's canonical upper-case
/// names; variant payloads keep the field names the rest of the crate uses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Payload {
    /// First message on a new peer link; binds the `node_id` label to the
    /// envelope's sender key.
    #[serde(rename = "HANDSHAKE")]
    Handshake { node_id: String, timestamp: u64 },

    /// Periodic liveness beacon refreshing `last_seen` on every peer.
    #[serde(rename = "HEARTBEAT")]
    Heartbeat { node_id: String, timestamp: u64 },

    /// A candidate operation entering three-phase agreement.
    #[serde(rename = "PBFT_PROPOSE")]
    PbftPropose { op: Operation },

    /// Prepare vote for `op_id`.
    #[serde(rename = "PBFT_PREPARE")]
    PbftPrepare {
        op_id: Uuid,
        voter_node_id: String,
        timestamp: u64,
    },

    /// Commit vote for `op_id`.
    #[serde(rename = "PBFT_COMMIT")]
    PbftCommit {
        op_id: Uuid,
        voter_node_id: String,
        timestamp: u64,
    },
}

impl Payload {
    /// Short protocol name, used for dispatch logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Handshake { .. } => "HANDSHAKE",
            Payload::Heartbeat { .. } => "HEARTBEAT",
            Payload::PbftPropose { .. } => "PBFT_PROPOSE",
            Payload::PbftPrepare { .. } => "PBFT_PREPARE",
            Payload::PbftCommit { .. } => "PBFT_COMMIT",
        }
    }
}

/// The canonical byte form of a payload: what gets signed and verified.
pub fn canonical_bytes(payload: &Payload) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(payload)?)
}

/// Signed wrapper around every wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Hex of the sender's raw 32-byte Ed25519 public key.
    pub sender: String,
    pub payload: Payload,
    /// Hex of the 64-byte Ed25519 signature over the canonical payload bytes.
    pub signature: String,
}

impl Envelope {
    /// Sign `payload` with this node's identity and wrap it for the wire.
    pub fn seal(identity: &NodeIdentity, payload: Payload) -> Result<Self, WireError> {
        let bytes = canonical_bytes(&payload)?;
        Ok(Self {
            sender: identity.public_key_hex().to_string(),
            signature: identity.sign(&bytes),
            payload,
        })
    }

    /// Check the signature against the embedded sender key.
    pub fn verify(&self) -> Result<(), WireError> {
        let bytes = canonical_bytes(&self.payload)?;
        if identity::verify(&bytes, &self.signature, &self.sender) {
            Ok(())
        } else {
            Err(WireError::BadSignature {
                sender: self.sender.clone(),
            })
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
