//! Failure detector: a periodic sweep over the peer registry that turns
//! prolonged heartbeat silence into FAIL_NODE proposals.
//!
//! A peer silent past `suspect_after_ms` becomes suspect; a peer that stays
//! suspect for a further `fail_grace_ms` is proposed failed, together with
//! reassignments for every open task it still owns. The proposal then runs
//! through normal consensus, so a single detector's false positive cannot
//! rewrite the cluster by itself.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use swarmd_common::{now_millis, task_key, FailNode, OpBody, Reassignment, TaskRecord};
use swarmd_storage::Store;

use crate::policy::SchedulingPolicy;
use crate::registry::PeerRegistry;

pub struct FailureDetector {
    node_id: String,
    registry: Arc<PeerRegistry>,
    store: Arc<dyn Store>,
    policy: Arc<dyn SchedulingPolicy>,
    proposals: mpsc::UnboundedSender<OpBody>,
    sweep_interval_ms: u64,
    suspect_after_ms: u64,
    fail_grace_ms: u64,
    shutdown: Arc<Notify>,
}

impl FailureDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: String,
        registry: Arc<PeerRegistry>,
        store: Arc<dyn Store>,
        policy: Arc<dyn SchedulingPolicy>,
        proposals: mpsc::UnboundedSender<OpBody>,
        sweep_interval_ms: u64,
        suspect_after_ms: u64,
        fail_grace_ms: u64,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            node_id,
            registry,
            store,
            policy,
            proposals,
            sweep_interval_ms,
            suspect_after_ms,
            fail_grace_ms,
            shutdown,
        }
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.sweep_interval_ms, "failure detector started");
            loop {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        info!("failure detector shutting down");
                        break;
                    }
                    _ = sleep(Duration::from_millis(self.sweep_interval_ms)) => {
                        self.run_once(now_millis());
                    }
                }
            }
        })
    }

    /// One sweep at time `now`. Separated from the ticker so tests can
    /// drive the clock directly.
    pub fn run_once(&self, now: u64) {
        let to_fail = self
            .registry
            .sweep(now, self.suspect_after_ms, self.fail_grace_ms);

        for failed in to_fail {
            let reassignments = self.plan_reassignments(&failed);
            warn!(
                peer = %failed,
                reassignments = reassignments.len(),
                "proposing FAIL_NODE"
            );
            let _ = self.proposals.send(OpBody::FailNode(FailNode {
                failed_node_id: failed,
                reassignments,
            }));
        }
    }

    /// Open tasks owned by `failed`, each paired with a policy-chosen new
    /// owner.
    fn plan_reassignments(&self, failed: &str) -> Vec<Reassignment> {
        let mut candidates = self.registry.live_ids();
        candidates.retain(|id| id != failed);
        candidates.push(self.node_id.clone());
        candidates.sort();
        candidates.dedup();

        let tasks = match self.store.range(&task_key("")) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot read tasks for reassignment planning: {}", e);
                return Vec::new();
            }
        };

        let mut reassignments = Vec::new();
        for (key, value) in tasks {
            let Ok(record) = serde_json::from_value::<TaskRecord>(value) else {
                warn!(%key, "skipping unreadable task record");
                continue;
            };
            if !record.is_open() || record.assigned_node != failed {
                continue;
            }
            let task_id = key.trim_start_matches("tasks/").to_string();
            if let Some(new_node) = self.policy.reassign(&task_id, failed, &candidates) {
                reassignments.push(Reassignment { task_id, new_node });
            }
        }
        reassignments
    }
}
