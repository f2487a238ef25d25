//! # swarmd Common Crate
//!
//! Shared building blocks for every swarmd workspace member.
//!
//! ## Modules
//! - `identity`: Ed25519 node identity, keypair persistence, sign/verify
//! - `wire`: signed message envelopes and the payload vocabulary
//! - `ops`: consensus operations and replicated task records
//! - `config`: environment-based node configuration
//! - `topic`: cluster rendezvous topic derivation
//!
//! Every wire and persisted format in swarmd is UTF-8 JSON via serde; the
//! canonical byte form used for signing lives in [`wire::canonical_bytes`].

pub mod config;
pub mod identity;
pub mod ops;
pub mod topic;
pub mod wire;

pub use config::{Config, ConfigError, RuntimeKind};
pub use identity::{IdentityError, NodeIdentity};
pub use ops::{
    task_key, AssignTask, FailNode, OpBody, Operation, Reassignment, TaskRecord, TaskStatus,
    UpdateTaskStatus,
};
pub use topic::cluster_topic;
pub use wire::{canonical_bytes, Envelope, Payload, WireError};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds. A clock before the epoch clamps to
/// zero rather than panicking.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
