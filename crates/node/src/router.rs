//! Message router: the only path from overlay bytes into node state.
//!
//! Per inbound frame: parse the envelope (drop malformed), verify the
//! Ed25519 signature over the canonical payload bytes against the embedded
//! sender key (drop and count failures as security events), then dispatch
//! by payload type. Nothing that fails the gate touches consensus or the
//! peer registry.
//!
//! The router also enforces identity binding: a HANDSHAKE must arrive on
//! the overlay stream of the key it is signed with, and votes claiming a
//! `voter_node_id` must be signed by the key that label is bound to.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use swarmd_common::{now_millis, Envelope, NodeIdentity, Payload};

use crate::apply::DecisionApplier;
use crate::consensus::{ConsensusEngine, Effect};
use crate::registry::{HandshakeOutcome, PeerRegistry};
use crate::transport::Overlay;

pub struct Router {
    identity: Arc<NodeIdentity>,
    node_id: String,
    registry: Arc<PeerRegistry>,
    engine: Arc<Mutex<ConsensusEngine>>,
    applier: Arc<DecisionApplier>,
    overlay: Arc<dyn Overlay>,
    /// Signature failures per sender key, exported via /status. A future
    /// ban policy hangs off this counter.
    auth_failures: Arc<RwLock<HashMap<String, u64>>>,
}

impl Router {
    pub fn new(
        identity: Arc<NodeIdentity>,
        node_id: String,
        registry: Arc<PeerRegistry>,
        engine: Arc<Mutex<ConsensusEngine>>,
        applier: Arc<DecisionApplier>,
        overlay: Arc<dyn Overlay>,
    ) -> Self {
        Self {
            identity,
            node_id,
            registry,
            engine,
            applier,
            overlay,
            auth_failures: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn auth_failures(&self) -> Arc<RwLock<HashMap<String, u64>>> {
        self.auth_failures.clone()
    }

    /// One inbound frame from the overlay stream tagged `remote_pk`.
    pub async fn handle_frame(&self, remote_pk: &str, bytes: &[u8]) {
        let envelope = match Envelope::from_bytes(bytes) {
            Ok(env) => env,
            Err(e) => {
                warn!(peer = %remote_pk, "dropping malformed message: {}", e);
                return;
            }
        };

        if envelope.verify().is_err() {
            let count = {
                let mut failures = self.auth_failures.write();
                let entry = failures.entry(envelope.sender.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            warn!(
                sender = %envelope.sender,
                failures = count,
                kind = envelope.payload.kind(),
                "signature verification failed, dropping message"
            );
            return;
        }

        let now = now_millis();
        match envelope.payload {
            Payload::Handshake { node_id, .. } => {
                // A handshake must ride the stream of the key that signed it.
                if envelope.sender != remote_pk {
                    warn!(
                        claimed = %envelope.sender,
                        stream = %remote_pk,
                        "handshake sender does not match stream key, dropping"
                    );
                    return;
                }
                match self.registry.upsert_on_handshake(&node_id, &envelope.sender, now) {
                    HandshakeOutcome::New => {
                        // Reply so the new peer binds our label as well.
                        self.send_handshake(remote_pk).await;
                    }
                    HandshakeOutcome::Refreshed => {}
                    HandshakeOutcome::Conflict => {}
                }
            }

            Payload::Heartbeat { node_id, .. } => {
                if !self.check_binding(&node_id, &envelope.sender, now) {
                    return;
                }
                self.registry.touch(&node_id, now);
            }

            Payload::PbftPropose { op } => {
                self.registry.touch_by_key(&envelope.sender, now);
                let effects = self.engine.lock().on_propose(op, now);
                self.execute_effects(effects).await;
            }

            Payload::PbftPrepare {
                op_id,
                voter_node_id,
                ..
            } => {
                if !self.check_binding(&voter_node_id, &envelope.sender, now) {
                    return;
                }
                self.registry.touch(&voter_node_id, now);
                let effects = self.engine.lock().on_prepare(op_id, &voter_node_id, now);
                self.execute_effects(effects).await;
            }

            Payload::PbftCommit {
                op_id,
                voter_node_id,
                ..
            } => {
                if !self.check_binding(&voter_node_id, &envelope.sender, now) {
                    return;
                }
                self.registry.touch(&voter_node_id, now);
                let effects = self.engine.lock().on_commit(op_id, &voter_node_id, now);
                self.execute_effects(effects).await;
            }
        }
    }

    /// Labels bind to the first key that uses them; a signed message
    /// claiming a label bound to some other key is dropped.
    fn check_binding(&self, node_id: &str, sender_pk: &str, now: u64) -> bool {
        match self.registry.public_key_of(node_id) {
            Some(bound) if bound == sender_pk => true,
            Some(bound) => {
                warn!(
                    label = %node_id,
                    bound = %bound,
                    sender = %sender_pk,
                    "message claims a label bound to a different key, dropping"
                );
                false
            }
            None => {
                // First sighting without a handshake: bind now, keyed by the
                // authenticated sender.
                debug!(label = %node_id, "binding label from first authenticated message");
                self.registry.upsert_on_handshake(node_id, sender_pk, now)
                    != HandshakeOutcome::Conflict
            }
        }
    }

    /// Perform the engine's effects: broadcasts go out sealed, decisions go
    /// to the single decision handler.
    pub async fn execute_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Broadcast(payload) => self.broadcast_payload(payload).await,
                Effect::Decide(op) => self.applier.apply(&op),
            }
        }
    }

    /// Seal a payload and send it to one peer.
    pub async fn send_payload(&self, pk: &str, payload: Payload) {
        let Ok(envelope) = Envelope::seal(&self.identity, payload) else {
            warn!("failed to seal payload");
            return;
        };
        match envelope.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.overlay.send(pk, bytes).await {
                    debug!(peer = %pk, "send failed: {}", e);
                }
            }
            Err(e) => warn!("failed to encode envelope: {}", e),
        }
    }

    /// Seal a payload and broadcast it to every connected peer.
    pub async fn broadcast_payload(&self, payload: Payload) {
        let Ok(envelope) = Envelope::seal(&self.identity, payload) else {
            warn!("failed to seal payload");
            return;
        };
        match envelope.to_bytes() {
            Ok(bytes) => self.overlay.broadcast(bytes).await,
            Err(e) => warn!("failed to encode envelope: {}", e),
        }
    }

    pub async fn send_handshake(&self, pk: &str) {
        let payload = Payload::Handshake {
            node_id: self.node_id.clone(),
            timestamp: now_millis(),
        };
        self.send_payload(pk, payload).await;
    }

    pub async fn broadcast_heartbeat(&self) {
        let payload = Payload::Heartbeat {
            node_id: self.node_id.clone(),
            timestamp: now_millis(),
        };
        self.broadcast_payload(payload).await;
    }
}
