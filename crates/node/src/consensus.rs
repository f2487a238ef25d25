//! # PBFT-lite Consensus Engine
//!
//! Three-phase agreement with no primary and no view changes: any node may
//! propose, every node votes, and an operation is DECIDED once both its
//! prepare and commit sets reach the quorum `Q`.
//!
//! ```text
//!            PROPOSED ──prepares ≥ Q, op known──► PREPARED
//!                                                    │
//!                                      commits ≥ Q, op known
//!                                                    ▼
//!                DECIDED ◄───────────────────── COMMITTED
//! ```
//!
//! The engine is a synchronous state machine: every input mutates one
//! record under the caller's lock and returns the [`Effect`]s to perform
//! (frames to broadcast, at most one decision to apply). Keeping I/O out of
//! the engine is what makes the §8-style properties directly testable.
//!
//! ## Safety notes
//!
//! - Vote sets are `BTreeSet`s, so duplicate votes and a re-entered self
//!   vote are no-ops by construction.
//! - PREPARE/COMMIT arriving before their PROPOSE land in a lazily created
//!   record with no `op`; nothing advances until the proposal is known.
//! - A decision fires only from `Prepared`, so at that moment both vote
//!   sets have reached quorum locally.
//! - Operations that never reach quorum stay pending forever. There is no
//!   per-operation timeout and no view change: the design trades
//!   availability under partition for simplicity.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use swarmd_common::{Operation, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Proposed,
    Prepared,
    Committed,
    Decided,
}

/// Per-operation consensus state.
///
/// `op` may be absent while votes arrive ahead of the proposal.
#[derive(Debug, Clone)]
pub struct ConsensusRecord {
    pub op: Option<Operation>,
    pub prepares: BTreeSet<String>,
    pub commits: BTreeSet<String>,
    pub phase: Phase,
}

impl ConsensusRecord {
    fn new() -> Self {
        Self {
            op: None,
            prepares: BTreeSet::new(),
            commits: BTreeSet::new(),
            phase: Phase::Proposed,
        }
    }
}

/// Side effects the caller must carry out after an engine call.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Seal into an envelope and broadcast to all peers.
    Broadcast(Payload),
    /// Run the decision handler. Emitted at most once per `op_id`.
    Decide(Operation),
}

#[derive(Debug)]
pub struct ConsensusEngine {
    self_id: String,
    quorum: usize,
    records: HashMap<Uuid, ConsensusRecord>,
    decided: u64,
}

impl ConsensusEngine {
    pub fn new(self_id: impl Into<String>, quorum: usize) -> Self {
        Self {
            self_id: self_id.into(),
            quorum,
            records: HashMap::new(),
            decided: 0,
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn decided_count(&self) -> u64 {
        self.decided
    }

    pub fn pending_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.phase < Phase::Decided)
            .count()
    }

    pub fn phase_of(&self, op_id: &Uuid) -> Option<Phase> {
        self.records.get(op_id).map(|r| r.phase)
    }

    pub fn record(&self, op_id: &Uuid) -> Option<&ConsensusRecord> {
        self.records.get(op_id)
    }

    /// Initiate agreement on an operation authored by this node. Stamps the
    /// proposer and timestamp, counts the implicit proposer prepare, and
    /// returns the PROPOSE + PREPARE broadcasts (plus the decision, for a
    /// single-node quorum).
    pub fn propose(&mut self, mut op: Operation, now: u64) -> Vec<Effect> {
        op.proposer = self.self_id.clone();
        op.timestamp = now;
        let op_id = op.op_id;

        let mut effects = Vec::new();
        let rec = self.records.entry(op_id).or_insert_with(ConsensusRecord::new);
        if rec.op.is_some() {
            warn!(%op_id, "refusing to re-propose a known operation");
            return effects;
        }
        rec.op = Some(op.clone());
        // The proposer implicitly prepares.
        rec.prepares.insert(self.self_id.clone());

        debug!(%op_id, "proposing operation");
        effects.push(Effect::Broadcast(Payload::PbftPropose { op }));
        self.self_prepare(op_id, now, &mut effects);
        self.advance(op_id, now, &mut effects);
        effects
    }

    /// Handle a PROPOSE received from a peer.
    pub fn on_propose(&mut self, op: Operation, now: u64) -> Vec<Effect> {
        let op_id = op.op_id;
        let mut effects = Vec::new();
        let rec = self.records.entry(op_id).or_insert_with(ConsensusRecord::new);

        match &rec.op {
            None => {
                rec.op = Some(op);
            }
            Some(known) if *known != op => {
                // A second, different operation under the same id is either
                // a bug or an equivocating proposer. First one wins.
                warn!(%op_id, proposer = %op.proposer, "conflicting proposal ignored");
                return effects;
            }
            Some(_) => {}
        }

        if rec.phase == Phase::Decided {
            return effects;
        }

        // Re-delivery guard: only vote once per operation.
        if !rec.prepares.contains(&self.self_id) {
            self.self_prepare(op_id, now, &mut effects);
        }
        self.advance(op_id, now, &mut effects);
        effects
    }

    /// Handle a PREPARE vote. The record is created lazily so votes may
    /// outrun their proposal.
    pub fn on_prepare(&mut self, op_id: Uuid, voter: &str, now: u64) -> Vec<Effect> {
        let rec = self.records.entry(op_id).or_insert_with(ConsensusRecord::new);
        rec.prepares.insert(voter.to_string());

        let mut effects = Vec::new();
        self.advance(op_id, now, &mut effects);
        effects
    }

    /// Handle a COMMIT vote.
    pub fn on_commit(&mut self, op_id: Uuid, voter: &str, now: u64) -> Vec<Effect> {
        let rec = self.records.entry(op_id).or_insert_with(ConsensusRecord::new);
        rec.commits.insert(voter.to_string());

        let mut effects = Vec::new();
        self.advance(op_id, now, &mut effects);
        effects
    }

    /// Broadcast our own PREPARE and count it locally.
    fn self_prepare(&mut self, op_id: Uuid, now: u64, effects: &mut Vec<Effect>) {
        effects.push(Effect::Broadcast(Payload::PbftPrepare {
            op_id,
            voter_node_id: self.self_id.clone(),
            timestamp: now,
        }));
        if let Some(rec) = self.records.get_mut(&op_id) {
            rec.prepares.insert(self.self_id.clone());
        }
    }

    /// Drive the record forward as far as the current votes allow. Phases
    /// never regress; the decision fires on exactly one call.
    fn advance(&mut self, op_id: Uuid, now: u64, effects: &mut Vec<Effect>) {
        let self_id = self.self_id.clone();
        let Some(rec) = self.records.get_mut(&op_id) else {
            return;
        };

        if rec.phase == Phase::Proposed && rec.op.is_some() && rec.prepares.len() >= self.quorum {
            rec.phase = Phase::Prepared;
            rec.commits.insert(self_id.clone());
            effects.push(Effect::Broadcast(Payload::PbftCommit {
                op_id,
                voter_node_id: self_id,
                timestamp: now,
            }));
        }

        if rec.phase == Phase::Prepared && rec.op.is_some() && rec.commits.len() >= self.quorum {
            rec.phase = Phase::Committed;
        }

        if rec.phase == Phase::Committed {
            if let Some(op) = rec.op.clone() {
                rec.phase = Phase::Decided;
                self.decided += 1;
                info!(
                    %op_id,
                    prepares = rec.prepares.len(),
                    commits = rec.commits.len(),
                    "operation decided"
                );
                effects.push(Effect::Decide(op));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmd_common::{AssignTask, OpBody};

    fn assign_op() -> Operation {
        Operation::new(
            "unset".into(),
            0,
            OpBody::AssignTask(AssignTask {
                task_id: "t1".into(),
                image: "alpine".into(),
                cmd: vec!["echo".into(), "hi".into()],
                assigned_node: "node-a".into(),
            }),
        )
    }

    fn decides(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Decide(_)))
            .count()
    }

    /// Deliver every broadcast produced by one engine to the others,
    /// returning any decisions observed along the way. A tiny synchronous
    /// stand-in for the overlay.
    fn deliver(engines: &mut [ConsensusEngine], from: usize, effects: Vec<Effect>) -> usize {
        let mut decided = decides(&effects);
        let from_id = engines[from].self_id.clone();
        for effect in effects {
            let Effect::Broadcast(payload) = effect else {
                continue;
            };
            for i in 0..engines.len() {
                if i == from {
                    continue;
                }
                let next = match &payload {
                    Payload::PbftPropose { op } => engines[i].on_propose(op.clone(), 1),
                    Payload::PbftPrepare { op_id, .. } => engines[i].on_prepare(*op_id, &from_id, 1),
                    Payload::PbftCommit { op_id, .. } => engines[i].on_commit(*op_id, &from_id, 1),
                    _ => Vec::new(),
                };
                decided += deliver(engines, i, next);
            }
        }
        decided
    }

    #[test]
    fn test_three_nodes_reach_decision() {
        let mut engines = vec![
            ConsensusEngine::new("node-a", 2),
            ConsensusEngine::new("node-b", 2),
            ConsensusEngine::new("node-c", 2),
        ];
        let op = assign_op();
        let op_id = op.op_id;

        let effects = engines[0].propose(op, 100);
        let total_decided = deliver(&mut engines, 0, effects);

        assert_eq!(total_decided, 3, "every node decides exactly once");
        for engine in &engines {
            assert_eq!(engine.phase_of(&op_id), Some(Phase::Decided));
            assert_eq!(engine.decided_count(), 1);
            let rec = engine.record(&op_id).expect("record");
            assert!(rec.prepares.len() >= 2, "prepare quorum at decision");
            assert!(rec.commits.len() >= 2, "commit quorum at decision");
        }
    }

    #[test]
    fn test_proposer_timestamp_and_identity_are_stamped() {
        let mut engine = ConsensusEngine::new("node-a", 2);
        let effects = engine.propose(assign_op(), 777);

        let Some(Effect::Broadcast(Payload::PbftPropose { op })) = effects.first() else {
            panic!("first effect must be the PROPOSE broadcast");
        };
        assert_eq!(op.proposer, "node-a");
        assert_eq!(op.timestamp, 777);
    }

    #[test]
    fn test_votes_before_proposal_are_held() {
        let mut engine = ConsensusEngine::new("node-c", 2);
        let op = assign_op();
        let op_id = op.op_id;

        // PREPARE and COMMIT from node-a arrive ahead of the proposal.
        let e1 = engine.on_prepare(op_id, "node-a", 1);
        let e2 = engine.on_commit(op_id, "node-a", 1);
        assert_eq!(decides(&e1) + decides(&e2), 0);
        assert_eq!(engine.phase_of(&op_id), Some(Phase::Proposed));

        // The proposal lands: node-c's own prepare completes the prepare
        // quorum, its own commit joins node-a's, and the decision fires.
        let e3 = engine.on_propose(op.clone(), 2);
        assert_eq!(decides(&e3), 1);
        assert_eq!(engine.phase_of(&op_id), Some(Phase::Decided));

        // Late re-delivery decides nothing further.
        let e4 = engine.on_propose(op, 3);
        let e5 = engine.on_commit(op_id, "node-b", 3);
        assert_eq!(decides(&e4) + decides(&e5), 0);
        assert_eq!(engine.decided_count(), 1);
    }

    #[test]
    fn test_duplicate_votes_count_once() {
        let mut engine = ConsensusEngine::new("node-a", 3);
        let op = assign_op();
        let op_id = op.op_id;
        engine.propose(op, 1);

        // Byzantine node-b prepares twice.
        engine.on_prepare(op_id, "node-b", 2);
        engine.on_prepare(op_id, "node-b", 3);

        let rec = engine.record(&op_id).expect("record");
        assert_eq!(rec.prepares.len(), 2, "self + node-b, duplicates collapsed");
        assert_eq!(engine.phase_of(&op_id), Some(Phase::Proposed));
    }

    #[test]
    fn test_self_vote_not_double_counted() {
        let mut engine = ConsensusEngine::new("node-a", 3);
        let op = assign_op();
        let op_id = op.op_id;
        engine.propose(op.clone(), 1);

        // Our own broadcast looped back through the network.
        engine.on_propose(op, 2);
        engine.on_prepare(op_id, "node-a", 2);

        let rec = engine.record(&op_id).expect("record");
        assert_eq!(rec.prepares.len(), 1);
    }

    #[test]
    fn test_phase_is_monotonic() {
        let mut engine = ConsensusEngine::new("node-a", 2);
        let op = assign_op();
        let op_id = op.op_id;

        engine.propose(op, 1);
        assert_eq!(engine.phase_of(&op_id), Some(Phase::Proposed));

        engine.on_prepare(op_id, "node-b", 2);
        assert_eq!(engine.phase_of(&op_id), Some(Phase::Prepared));

        engine.on_commit(op_id, "node-b", 3);
        assert_eq!(engine.phase_of(&op_id), Some(Phase::Decided));

        // A stray late prepare cannot regress the phase.
        engine.on_prepare(op_id, "node-d", 4);
        assert_eq!(engine.phase_of(&op_id), Some(Phase::Decided));
    }

    #[test]
    fn test_insufficient_quorum_stays_pending() {
        let mut engine = ConsensusEngine::new("node-a", 3);
        let op = assign_op();
        let op_id = op.op_id;

        engine.propose(op, 1);
        engine.on_prepare(op_id, "node-b", 2);

        assert_eq!(engine.phase_of(&op_id), Some(Phase::Proposed));
        assert_eq!(engine.pending_count(), 1);
        assert_eq!(engine.decided_count(), 0);
    }

    #[test]
    fn test_single_node_quorum_decides_immediately() {
        let mut engine = ConsensusEngine::new("node-a", 1);
        let effects = engine.propose(assign_op(), 1);
        assert_eq!(decides(&effects), 1);
    }

    #[test]
    fn test_conflicting_proposal_is_ignored() {
        let mut engine = ConsensusEngine::new("node-c", 2);
        let op = assign_op();
        let op_id = op.op_id;
        engine.on_propose(op.clone(), 1);

        let mut forged = op;
        forged.proposer = "node-evil".into();
        engine.on_propose(forged, 2);

        let rec = engine.record(&op_id).expect("record");
        assert_eq!(rec.op.as_ref().expect("op").proposer, "unset");
    }
}
