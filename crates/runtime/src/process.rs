//! Local-process backend: the task argv runs directly as a child of the
//! node. The `image` field is logged but otherwise ignored, which makes
//! this backend the stand-in for environments without a container engine
//! (CI, unit tests, single-machine demos).

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::{ContainerRuntime, RunOutput, RunSpec, RuntimeError};

#[derive(Debug, Default)]
pub struct ProcessRuntime;

impl ProcessRuntime {
    pub fn new() -> Self {
        Self
    }
}

/// Forward one output stream to the node log, line by line, under the task
/// id. Runs until the stream closes.
fn stream_lines<R>(task_id: String, stream_name: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(task = %task_id, stream = stream_name, "{}", line);
        }
    });
}

/// Shared child supervision: wire up output streaming, then wait with an
/// optional wall-clock cap. A timed-out child is killed and reaped.
pub(crate) async fn stream_and_wait(
    task_id: &str,
    mut child: Child,
    timeout_ms: Option<u64>,
) -> Result<RunOutput, RuntimeError> {
    if let Some(out) = child.stdout.take() {
        stream_lines(task_id.to_string(), "stdout", out);
    }
    if let Some(err) = child.stderr.take() {
        stream_lines(task_id.to_string(), "stderr", err);
    }

    let status = match timeout_ms {
        Some(ms) => match timeout(Duration::from_millis(ms), child.wait()).await {
            Ok(res) => res?,
            Err(_) => {
                warn!(task = %task_id, timeout_ms = ms, "task exceeded timeout, killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Ok(RunOutput {
                    exit_code: None,
                    timed_out: true,
                });
            }
        },
        None => child.wait().await?,
    };

    debug!(task = %task_id, code = ?status.code(), "task exited");
    Ok(RunOutput {
        exit_code: status.code(),
        timed_out: false,
    })
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    async fn run(&self, spec: RunSpec) -> Result<RunOutput, RuntimeError> {
        let Some((program, args)) = spec.cmd.split_first() else {
            return Err(RuntimeError::InvalidSpec("empty command".into()));
        };

        info!(task = %spec.task_id, image = %spec.image, program = %program,
              "running task as local process");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Spawn(format!("{}: {}", program, e)))?;

        stream_and_wait(&spec.task_id, child, spec.timeout_ms).await
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    fn spec(cmd: &[&str], timeout_ms: Option<u64>) -> RunSpec {
        RunSpec {
            task_id: "t-test".into(),
            image: "none".into(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            timeout_ms,
        }
    }

    #[tokio::test]
    async fn test_zero_exit_succeeds() {
        let rt = ProcessRuntime::new();
        let out = rt.run(spec(&["sh", "-c", "echo hi"], None)).await.expect("run");
        assert_eq!(out.exit_code, Some(0));
        assert!(out.succeeded());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let rt = ProcessRuntime::new();
        let out = rt.run(spec(&["sh", "-c", "exit 2"], None)).await.expect("run");
        assert_eq!(out.exit_code, Some(2));
        assert!(!out.succeeded());
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let rt = ProcessRuntime::new();
        let out = rt
            .run(spec(&["sh", "-c", "sleep 10"], Some(100)))
            .await
            .expect("run");
        assert!(out.timed_out);
        assert_eq!(out.exit_code, None);
        assert!(!out.succeeded());
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let rt = ProcessRuntime::new();
        assert!(rt.run(spec(&[], None)).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let rt = ProcessRuntime::new();
        let err = rt
            .run(spec(&["swarmd-definitely-not-a-program"], None))
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, RuntimeError::Spawn(_)));
    }
}
