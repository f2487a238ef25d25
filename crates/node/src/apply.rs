//! The decision handler: the one place replicated state changes.
//!
//! Consensus emits `Effect::Decide(op)` at most once per operation per
//! node; everything here is therefore idempotent against redelivery only
//! through the store's last-writer-wins stamps. Decisions apply in local
//! decision order, which may differ between nodes; the `(timestamp, op_id)`
//! stamp makes every replica converge regardless.
//!
//! Storage failures are logged and skipped: the decision is not replayed
//! (there is no durable consensus log), which is the documented gap a
//! write-ahead log would close.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use swarmd_common::{task_key, OpBody, Operation, TaskRecord, TaskStatus};
use swarmd_storage::{Stamp, Store};

use crate::registry::PeerRegistry;

/// Order to the worker supervisor: run this task locally.
#[derive(Debug, Clone)]
pub struct TaskLaunch {
    pub task_id: String,
    pub image: String,
    pub cmd: Vec<String>,
}

pub struct DecisionApplier {
    node_id: String,
    store: Arc<dyn Store>,
    registry: Arc<PeerRegistry>,
    launches: mpsc::UnboundedSender<TaskLaunch>,
}

impl DecisionApplier {
    pub fn new(
        node_id: String,
        store: Arc<dyn Store>,
        registry: Arc<PeerRegistry>,
        launches: mpsc::UnboundedSender<TaskLaunch>,
    ) -> Self {
        Self {
            node_id,
            store,
            registry,
            launches,
        }
    }

    /// Apply one DECIDED operation to local state.
    pub fn apply(&self, op: &Operation) {
        let stamp = Stamp::new(op.timestamp, op.op_id);
        match &op.body {
            OpBody::AssignTask(assign) => self.apply_assign(assign, op, stamp),
            OpBody::UpdateTaskStatus(update) => self.apply_status(update, op, stamp),
            OpBody::FailNode(fail) => self.apply_fail_node(fail, op, stamp),
        }
    }

    fn apply_assign(&self, assign: &swarmd_common::AssignTask, op: &Operation, stamp: Stamp) {
        let record = TaskRecord::assigned(assign, op.timestamp);
        let key = task_key(&assign.task_id);

        let value = match serde_json::to_value(&record) {
            Ok(v) => v,
            Err(e) => {
                error!(task = %assign.task_id, "failed to encode task record: {}", e);
                return;
            }
        };
        match self.store.put(&key, value, stamp) {
            Ok(true) => {
                info!(
                    task = %assign.task_id,
                    node = %assign.assigned_node,
                    image = %assign.image,
                    "task assigned"
                );
                if assign.assigned_node == self.node_id {
                    self.launch(&assign.task_id, &assign.image, &assign.cmd);
                }
            }
            Ok(false) => {
                // A newer write already holds the key; nothing to run.
            }
            Err(e) => error!(task = %assign.task_id, "store write failed: {}", e),
        }
    }

    fn apply_status(&self, update: &swarmd_common::UpdateTaskStatus, op: &Operation, stamp: Stamp) {
        let key = task_key(&update.task_id);
        let current = match self.store.get(&key) {
            Ok(Some(v)) => v,
            Ok(None) => {
                warn!(task = %update.task_id, "status update for unknown task, skipping");
                return;
            }
            Err(e) => {
                error!(task = %update.task_id, "store read failed: {}", e);
                return;
            }
        };
        let mut record: TaskRecord = match serde_json::from_value(current) {
            Ok(r) => r,
            Err(e) => {
                error!(task = %update.task_id, "corrupt task record: {}", e);
                return;
            }
        };

        if !record.status.can_advance_to(update.status) {
            warn!(
                task = %update.task_id,
                from = %record.status,
                to = %update.status,
                "rejecting backward status transition"
            );
            return;
        }

        record.status = update.status;
        if update.status.is_terminal() {
            record.completed_at = Some(op.timestamp);
            record.exit_code = update.exit_code;
        }

        let value = match serde_json::to_value(&record) {
            Ok(v) => v,
            Err(e) => {
                error!(task = %update.task_id, "failed to encode task record: {}", e);
                return;
            }
        };
        match self.store.put(&key, value, stamp) {
            Ok(applied) => {
                if applied {
                    info!(task = %update.task_id, status = %update.status, "task status updated");
                }
            }
            Err(e) => error!(task = %update.task_id, "store write failed: {}", e),
        }
    }

    fn apply_fail_node(&self, fail: &swarmd_common::FailNode, op: &Operation, stamp: Stamp) {
        warn!(
            failed = %fail.failed_node_id,
            reassignments = fail.reassignments.len(),
            "node declared failed by consensus"
        );
        self.registry.mark_dead(&fail.failed_node_id);

        for reassignment in &fail.reassignments {
            let key = task_key(&reassignment.task_id);
            let record: TaskRecord = match self.store.get(&key) {
                Ok(Some(v)) => match serde_json::from_value(v) {
                    Ok(r) => r,
                    Err(e) => {
                        error!(task = %reassignment.task_id, "corrupt task record: {}", e);
                        continue;
                    }
                },
                Ok(None) => {
                    warn!(task = %reassignment.task_id, "reassignment for unknown task");
                    continue;
                }
                Err(e) => {
                    error!(task = %reassignment.task_id, "store read failed: {}", e);
                    continue;
                }
            };

            // Terminal tasks have nothing left to move.
            if !record.is_open() {
                continue;
            }

            let moved = record.reassigned_to(&reassignment.new_node, op.timestamp);
            let value = match serde_json::to_value(&moved) {
                Ok(v) => v,
                Err(e) => {
                    error!(task = %reassignment.task_id, "failed to encode task record: {}", e);
                    continue;
                }
            };
            match self.store.put(&key, value, stamp) {
                Ok(true) => {
                    info!(
                        task = %reassignment.task_id,
                        from = %fail.failed_node_id,
                        to = %reassignment.new_node,
                        "task reassigned"
                    );
                    if reassignment.new_node == self.node_id {
                        self.launch(&reassignment.task_id, &moved.image, &moved.cmd);
                    }
                }
                Ok(false) => {}
                Err(e) => error!(task = %reassignment.task_id, "store write failed: {}", e),
            }
        }
    }

    fn launch(&self, task_id: &str, image: &str, cmd: &[String]) {
        let launch = TaskLaunch {
            task_id: task_id.to_string(),
            image: image.to_string(),
            cmd: cmd.to_vec(),
        };
        if self.launches.send(launch).is_err() {
            // Supervisor already shut down; the task stays assigned in the
            // store and a reassignment will eventually move it.
            warn!(task = %task_id, "worker supervisor unavailable, launch dropped");
        }
    }
}
