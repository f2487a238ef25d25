//! Simulated task submitter: with no external client API in scope, each
//! node periodically proposes a small demo task through the normal
//! consensus path. Disabled by setting the interval to zero.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::info;
use uuid::Uuid;

use swarmd_common::{AssignTask, OpBody};

use crate::policy::SchedulingPolicy;

const DEMO_IMAGE: &str = "alpine";

pub struct SimulatedProposer {
    node_id: String,
    policy: Arc<dyn SchedulingPolicy>,
    proposals: mpsc::UnboundedSender<OpBody>,
    interval_ms: u64,
    shutdown: Arc<Notify>,
}

impl SimulatedProposer {
    pub fn new(
        node_id: String,
        policy: Arc<dyn SchedulingPolicy>,
        proposals: mpsc::UnboundedSender<OpBody>,
        interval_ms: u64,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            node_id,
            policy,
            proposals,
            interval_ms,
            shutdown,
        }
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval_ms, "simulated proposer started");
            loop {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        info!("simulated proposer shutting down");
                        break;
                    }
                    _ = sleep(Duration::from_millis(self.interval_ms)) => {
                        if self.proposals.send(self.next_task()).is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn next_task(&self) -> OpBody {
        let task_id = format!("task-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let assigned_node = self.policy.assign(&task_id);
        info!(task = %task_id, node = %assigned_node, "submitting demo task");
        OpBody::AssignTask(AssignTask {
            task_id,
            image: DEMO_IMAGE.to_string(),
            cmd: vec![
                "echo".to_string(),
                format!("hello from {}", self.node_id),
            ],
            assigned_node,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AssignToSelf;

    #[test]
    fn test_demo_tasks_are_unique_and_self_assigned() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let proposer = SimulatedProposer::new(
            "node-a".into(),
            Arc::new(AssignToSelf::new("node-a")),
            tx,
            15_000,
            Arc::new(Notify::new()),
        );

        let OpBody::AssignTask(first) = proposer.next_task() else {
            panic!("expected an assignment");
        };
        let OpBody::AssignTask(second) = proposer.next_task() else {
            panic!("expected an assignment");
        };

        assert_ne!(first.task_id, second.task_id);
        assert_eq!(first.assigned_node, "node-a");
        assert_eq!(first.image, DEMO_IMAGE);
        assert_eq!(first.cmd[0], "echo");
    }
}
