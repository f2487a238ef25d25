//! Peer registry: one record per `node_id` label, binding it to a public
//! key and tracking liveness.
//!
//! Records are created on the first HANDSHAKE (or on the first
//! authenticated message from a label the node has never seen), refreshed
//! by the router on every authenticated message, and demoted by the failure
//! detector's sweep. The label-to-key binding is first-come: a handshake
//! claiming an already-bound label with a different key is a conflict and
//! is dropped by the router.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Live,
    Suspect,
    Dead,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerRecord {
    pub node_id: String,
    pub public_key: String,
    /// Unix millis of the last authenticated message from this peer.
    pub last_seen: u64,
    pub liveness: Liveness,
    #[serde(skip)]
    pub suspect_since: Option<u64>,
    /// Set once a FAIL_NODE has been proposed for this peer, so the sweep
    /// does not re-propose every interval. Cleared if the peer comes back.
    #[serde(skip)]
    pub failure_proposed: bool,
}

/// Outcome of a handshake upsert, used by the router to decide whether to
/// reply and whether to drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// First time this label was seen; a handshake reply is warranted.
    New,
    /// Known label, same key; last_seen refreshed.
    Refreshed,
    /// Known label bound to a different key; the message must be dropped.
    Conflict,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_on_handshake(&self, node_id: &str, public_key: &str, now: u64) -> HandshakeOutcome {
        let mut peers = self.peers.write();
        match peers.get_mut(node_id) {
            None => {
                info!(peer = %node_id, "peer joined");
                peers.insert(
                    node_id.to_string(),
                    PeerRecord {
                        node_id: node_id.to_string(),
                        public_key: public_key.to_string(),
                        last_seen: now,
                        liveness: Liveness::Live,
                        suspect_since: None,
                        failure_proposed: false,
                    },
                );
                HandshakeOutcome::New
            }
            Some(rec) if rec.public_key == public_key => {
                rec.last_seen = now;
                rec.liveness = Liveness::Live;
                rec.suspect_since = None;
                rec.failure_proposed = false;
                HandshakeOutcome::Refreshed
            }
            Some(rec) => {
                warn!(
                    peer = %node_id,
                    bound = %rec.public_key,
                    claimed = %public_key,
                    "handshake for already-bound label with a different key"
                );
                HandshakeOutcome::Conflict
            }
        }
    }

    /// Key bound to a label, if any.
    pub fn public_key_of(&self, node_id: &str) -> Option<String> {
        self.peers.read().get(node_id).map(|r| r.public_key.clone())
    }

    pub fn node_id_for_key(&self, public_key: &str) -> Option<String> {
        self.peers
            .read()
            .values()
            .find(|r| r.public_key == public_key)
            .map(|r| r.node_id.clone())
    }

    /// Refresh `last_seen` for a label. A suspect peer that speaks again
    /// becomes live and any pending failure proposal is forgotten.
    pub fn touch(&self, node_id: &str, now: u64) -> bool {
        let mut peers = self.peers.write();
        match peers.get_mut(node_id) {
            Some(rec) => {
                rec.last_seen = rec.last_seen.max(now);
                if rec.liveness != Liveness::Live {
                    info!(peer = %node_id, "peer recovered");
                }
                rec.liveness = Liveness::Live;
                rec.suspect_since = None;
                rec.failure_proposed = false;
                true
            }
            None => false,
        }
    }

    pub fn touch_by_key(&self, public_key: &str, now: u64) {
        let mut peers = self.peers.write();
        if let Some(rec) = peers.values_mut().find(|r| r.public_key == public_key) {
            rec.last_seen = rec.last_seen.max(now);
            rec.liveness = Liveness::Live;
            rec.suspect_since = None;
            rec.failure_proposed = false;
        }
    }

    pub fn mark_dead(&self, node_id: &str) {
        let mut peers = self.peers.write();
        if let Some(rec) = peers.get_mut(node_id) {
            if rec.liveness != Liveness::Dead {
                warn!(peer = %node_id, "peer marked dead");
            }
            rec.liveness = Liveness::Dead;
        }
    }

    pub fn remove(&self, node_id: &str) {
        self.peers.write().remove(node_id);
    }

    /// Labels of peers currently considered live.
    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .peers
            .read()
            .values()
            .filter(|r| r.liveness == Liveness::Live)
            .map(|r| r.node_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut all: Vec<PeerRecord> = self.peers.read().values().cloned().collect();
        all.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        all
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One failure-detector pass. Live peers silent past `suspect_after_ms`
    /// become suspect; peers suspect for a further `fail_grace_ms` are
    /// returned exactly once as FAIL_NODE candidates.
    pub fn sweep(&self, now: u64, suspect_after_ms: u64, fail_grace_ms: u64) -> Vec<String> {
        let mut to_fail = Vec::new();
        let mut peers = self.peers.write();

        for rec in peers.values_mut() {
            match rec.liveness {
                Liveness::Live => {
                    if now.saturating_sub(rec.last_seen) > suspect_after_ms {
                        warn!(
                            peer = %rec.node_id,
                            silent_ms = now.saturating_sub(rec.last_seen),
                            "peer silent past threshold, marking suspect"
                        );
                        rec.liveness = Liveness::Suspect;
                        rec.suspect_since = Some(now);
                    }
                }
                Liveness::Suspect => {
                    let since = rec.suspect_since.unwrap_or(now);
                    if !rec.failure_proposed && now.saturating_sub(since) >= fail_grace_ms {
                        rec.failure_proposed = true;
                        to_fail.push(rec.node_id.clone());
                    }
                }
                Liveness::Dead => {}
            }
        }

        to_fail.sort();
        to_fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_upsert_and_conflict() {
        let reg = PeerRegistry::new();

        assert_eq!(
            reg.upsert_on_handshake("node-b", "pk-b", 100),
            HandshakeOutcome::New
        );
        assert_eq!(
            reg.upsert_on_handshake("node-b", "pk-b", 200),
            HandshakeOutcome::Refreshed
        );
        assert_eq!(
            reg.upsert_on_handshake("node-b", "pk-evil", 300),
            HandshakeOutcome::Conflict
        );

        // The original binding survives the conflicting claim.
        assert_eq!(reg.public_key_of("node-b").as_deref(), Some("pk-b"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_touch_refreshes_and_revives() {
        let reg = PeerRegistry::new();
        reg.upsert_on_handshake("node-b", "pk-b", 0);

        // Silence makes it suspect.
        let failed = reg.sweep(20_000, 15_000, 10_000);
        assert!(failed.is_empty());
        assert_eq!(reg.snapshot()[0].liveness, Liveness::Suspect);

        // A heartbeat brings it back.
        assert!(reg.touch("node-b", 21_000));
        assert_eq!(reg.snapshot()[0].liveness, Liveness::Live);
        assert_eq!(reg.live_ids(), vec!["node-b".to_string()]);
    }

    #[test]
    fn test_sweep_proposes_failure_exactly_once() {
        let reg = PeerRegistry::new();
        reg.upsert_on_handshake("node-b", "pk-b", 0);

        // First sweep: suspect only.
        assert!(reg.sweep(16_000, 15_000, 10_000).is_empty());
        // Second sweep, past the grace: proposed once.
        assert_eq!(reg.sweep(26_000, 15_000, 10_000), vec!["node-b".to_string()]);
        // Further sweeps stay quiet.
        assert!(reg.sweep(36_000, 15_000, 10_000).is_empty());
    }

    #[test]
    fn test_heartbeat_within_threshold_never_suspect() {
        let reg = PeerRegistry::new();
        reg.upsert_on_handshake("node-b", "pk-b", 0);

        // Heartbeats every 5s; sweeps see silence under 15s.
        for t in [5_000u64, 10_000, 15_000] {
            reg.touch("node-b", t);
            assert!(reg.sweep(t + 4_999, 15_000, 10_000).is_empty());
            assert_eq!(reg.snapshot()[0].liveness, Liveness::Live);
        }
    }

    #[test]
    fn test_dead_peers_are_ignored_by_sweep() {
        let reg = PeerRegistry::new();
        reg.upsert_on_handshake("node-b", "pk-b", 0);
        reg.mark_dead("node-b");

        assert!(reg.sweep(100_000, 15_000, 10_000).is_empty());
        assert!(reg.live_ids().is_empty());
    }

    #[test]
    fn test_last_seen_is_monotonic() {
        let reg = PeerRegistry::new();
        reg.upsert_on_handshake("node-b", "pk-b", 500);
        // An out-of-order touch with an older timestamp must not regress.
        reg.touch("node-b", 100);
        assert_eq!(reg.snapshot()[0].last_seen, 500);
    }
}
