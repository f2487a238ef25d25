//! # swarmd Runtime Crate
//!
//! The container-runtime capability consumed by the worker supervisor:
//! "run `image` with `cmd`, auto-remove on exit, stream output to the node
//! log, yield the exit code".
//!
//! Two backends implement [`ContainerRuntime`]:
//!
//! - [`DockerRuntime`]: shells out to the `docker` CLI (`docker run --rm`).
//! - [`ProcessRuntime`]: executes the task argv directly as a local child
//!   process. No container engine required; this is the backend tests and
//!   single-machine development use.
//!
//! Both stream stdout/stderr line by line into `tracing` under the task id,
//! and both map a timeout to a killed child plus `timed_out = true`.

pub mod docker;
pub mod process;

use async_trait::async_trait;
use thiserror::Error;

pub use docker::DockerRuntime;
pub use process::ProcessRuntime;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to spawn task process: {0}")]
    Spawn(String),

    #[error("task runtime I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid task spec: {0}")]
    InvalidSpec(String),
}

/// One container task to run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub task_id: String,
    pub image: String,
    pub cmd: Vec<String>,
    /// Wall-clock cap; `None` runs to completion.
    pub timeout_ms: Option<u64>,
}

/// Outcome of a finished (or killed) task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// `None` when the child was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl RunOutput {
    /// The success criterion the supervisor maps to `completed`.
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run(&self, spec: RunSpec) -> Result<RunOutput, RuntimeError>;
}
