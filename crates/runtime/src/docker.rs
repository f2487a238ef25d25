//! Docker CLI backend: `docker run --rm --name swarmd-<task_id> <image>
//! <cmd...>`. The container is auto-removed on exit; its output streams into
//! the node log exactly like the process backend.
//!
//! The binary name is configurable so a `podman` symlink or a wrapper script
//! slots in without code changes.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::process::stream_and_wait;
use crate::{ContainerRuntime, RunOutput, RunSpec, RuntimeError};

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn container_name(task_id: &str) -> String {
        // Docker names admit [a-zA-Z0-9][a-zA-Z0-9_.-]*; task ids may not.
        let sanitized: String = task_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        format!("swarmd-{}", sanitized)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run(&self, spec: RunSpec) -> Result<RunOutput, RuntimeError> {
        if spec.image.trim().is_empty() {
            return Err(RuntimeError::InvalidSpec("empty image".into()));
        }

        info!(task = %spec.task_id, image = %spec.image, "running task container");

        let child = Command::new(&self.binary)
            .arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(Self::container_name(&spec.task_id))
            .arg(&spec.image)
            .args(&spec.cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Spawn(format!("{} run: {}", self.binary, e)))?;

        stream_and_wait(&spec.task_id, child, spec.timeout_ms).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name_is_sanitized() {
        assert_eq!(DockerRuntime::container_name("t1"), "swarmd-t1");
        assert_eq!(
            DockerRuntime::container_name("task/with:odd chars"),
            "swarmd-task-with-odd-chars"
        );
    }

    #[tokio::test]
    async fn test_empty_image_rejected() {
        let rt = DockerRuntime::new();
        let spec = RunSpec {
            task_id: "t".into(),
            image: "  ".into(),
            cmd: vec!["echo".into()],
            timeout_ms: None,
        };
        assert!(matches!(rt.run(spec).await, Err(RuntimeError::InvalidSpec(_))));
    }
}
