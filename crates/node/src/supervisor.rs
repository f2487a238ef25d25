//! Worker supervisor: turns locally-assigned decisions into container
//! executions and feeds the outcomes back through consensus.
//!
//! For every [`TaskLaunch`] the supervisor proposes `running`, invokes the
//! [`ContainerRuntime`] capability, and proposes `completed` (exit 0) or
//! `failed` (anything else). The store itself is never touched from here;
//! worker outcomes become visible only once the status operation is
//! decided, which keeps the decided-writes-only invariant intact.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

use swarmd_common::{OpBody, TaskStatus, UpdateTaskStatus};
use swarmd_runtime::{ContainerRuntime, RunSpec};

use crate::apply::TaskLaunch;

pub struct WorkerSupervisor {
    node_id: String,
    runtime: Arc<dyn ContainerRuntime>,
    proposals: mpsc::UnboundedSender<OpBody>,
    shutdown: Arc<Notify>,
    /// How long shutdown waits for in-flight workers before abandoning them.
    grace_ms: u64,
}

impl WorkerSupervisor {
    pub fn new(
        node_id: String,
        runtime: Arc<dyn ContainerRuntime>,
        proposals: mpsc::UnboundedSender<OpBody>,
        shutdown: Arc<Notify>,
        grace_ms: u64,
    ) -> Self {
        Self {
            node_id,
            runtime,
            proposals,
            shutdown,
            grace_ms,
        }
    }

    pub fn start(self: Arc<Self>, mut launches: mpsc::UnboundedReceiver<TaskLaunch>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut workers = JoinSet::new();
            loop {
                tokio::select! {
                    _ = self.shutdown.notified() => break,
                    maybe = launches.recv() => match maybe {
                        Some(launch) => {
                            info!(task = %launch.task_id, node = %self.node_id, "launching worker");
                            let runtime = self.runtime.clone();
                            let proposals = self.proposals.clone();
                            workers.spawn(run_worker(runtime, proposals, launch));
                        }
                        None => break,
                    },
                    // Reap finished workers so the set does not grow.
                    Some(_) = workers.join_next(), if !workers.is_empty() => {}
                }
            }

            if workers.is_empty() {
                return;
            }
            info!(
                outstanding = workers.len(),
                grace_ms = self.grace_ms,
                "waiting for outstanding workers"
            );
            let grace = Duration::from_millis(self.grace_ms);
            let drained = timeout(grace, async {
                while workers.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("grace period expired, abandoning outstanding workers");
                workers.abort_all();
            }
        })
    }
}

/// One worker: run the container, map the exit, report back as proposals.
async fn run_worker(
    runtime: Arc<dyn ContainerRuntime>,
    proposals: mpsc::UnboundedSender<OpBody>,
    launch: TaskLaunch,
) {
    let _ = proposals.send(OpBody::UpdateTaskStatus(UpdateTaskStatus {
        task_id: launch.task_id.clone(),
        status: TaskStatus::Running,
        exit_code: None,
    }));

    let spec = RunSpec {
        task_id: launch.task_id.clone(),
        image: launch.image,
        cmd: launch.cmd,
        timeout_ms: None,
    };

    let (status, exit_code) = match runtime.run(spec).await {
        Ok(out) if out.succeeded() => (TaskStatus::Completed, out.exit_code),
        Ok(out) => {
            warn!(
                task = %launch.task_id,
                exit = ?out.exit_code,
                timed_out = out.timed_out,
                "worker finished unsuccessfully"
            );
            (TaskStatus::Failed, out.exit_code)
        }
        Err(e) => {
            warn!(task = %launch.task_id, "worker could not run: {}", e);
            (TaskStatus::Failed, None)
        }
    };

    info!(task = %launch.task_id, status = %status, "worker finished");
    let _ = proposals.send(OpBody::UpdateTaskStatus(UpdateTaskStatus {
        task_id: launch.task_id,
        status,
        exit_code,
    }));
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use swarmd_runtime::ProcessRuntime;
    use tokio::time::timeout as tokio_timeout;

    async fn next_status(
        rx: &mut mpsc::UnboundedReceiver<OpBody>,
    ) -> UpdateTaskStatus {
        let body = tokio_timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("proposal within timeout")
            .expect("channel open");
        match body {
            OpBody::UpdateTaskStatus(u) => u,
            other => panic!("expected status proposal, got {:?}", other),
        }
    }

    fn launch(cmd: &[&str]) -> TaskLaunch {
        TaskLaunch {
            task_id: "t1".into(),
            image: "none".into(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_successful_worker_reports_running_then_completed() {
        let (proposals_tx, mut proposals_rx) = mpsc::unbounded_channel();
        let (launch_tx, launch_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(WorkerSupervisor::new(
            "node-a".into(),
            Arc::new(ProcessRuntime::new()),
            proposals_tx,
            Arc::new(Notify::new()),
            1_000,
        ));
        let handle = supervisor.start(launch_rx);

        launch_tx.send(launch(&["sh", "-c", "echo done"])).expect("send");

        let first = next_status(&mut proposals_rx).await;
        assert_eq!(first.status, TaskStatus::Running);

        let second = next_status(&mut proposals_rx).await;
        assert_eq!(second.status, TaskStatus::Completed);
        assert_eq!(second.exit_code, Some(0));

        drop(launch_tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_failed() {
        let (proposals_tx, mut proposals_rx) = mpsc::unbounded_channel();
        let (launch_tx, launch_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(WorkerSupervisor::new(
            "node-a".into(),
            Arc::new(ProcessRuntime::new()),
            proposals_tx,
            Arc::new(Notify::new()),
            1_000,
        ));
        let handle = supervisor.start(launch_rx);

        launch_tx.send(launch(&["sh", "-c", "exit 2"])).expect("send");

        assert_eq!(next_status(&mut proposals_rx).await.status, TaskStatus::Running);
        let outcome = next_status(&mut proposals_rx).await;
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.exit_code, Some(2));

        drop(launch_tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_unspawnable_worker_reports_failed() {
        let (proposals_tx, mut proposals_rx) = mpsc::unbounded_channel();
        let (launch_tx, launch_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(WorkerSupervisor::new(
            "node-a".into(),
            Arc::new(ProcessRuntime::new()),
            proposals_tx,
            Arc::new(Notify::new()),
            1_000,
        ));
        let handle = supervisor.start(launch_rx);

        launch_tx
            .send(launch(&["swarmd-no-such-binary"]))
            .expect("send");

        assert_eq!(next_status(&mut proposals_rx).await.status, TaskStatus::Running);
        let outcome = next_status(&mut proposals_rx).await;
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.exit_code, None);

        drop(launch_tx);
        let _ = handle.await;
    }
}
