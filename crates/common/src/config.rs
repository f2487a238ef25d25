//! Node configuration, environment-only by design: the node binary takes no
//! CLI flags, so every knob below maps 1:1 to an environment variable.
//!
//! Required variables: none. Every option has a default that brings up a
//! single-node demo swarm; a real cluster sets at least `NODE_ID`,
//! `SWARM_LISTEN` and `SWARM_PEERS`.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Which container-runtime backend the worker supervisor uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    /// Shell out to the `docker` CLI (`docker run --rm ...`).
    Docker,
    /// Execute the task argv directly as a local child process. Used for
    /// development and tests where no container engine is present.
    Process,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Human-readable node label; orthogonal to the cryptographic identity.
    pub node_id: String,
    /// Directory for the keypair and the store backing file.
    pub storage_path: PathBuf,
    /// Cluster name; all nodes deriving the same topic form one swarm.
    pub swarm_name: String,
    /// Observability HTTP port; 0 disables the server.
    pub http_port: u16,
    /// Reserved for a future external API. Parsed, never used by the core.
    pub ws_port: u16,
    /// Bind address of the reference TCP overlay.
    pub listen_addr: String,
    /// Bootstrap `host:port` peer addresses for the reference TCP overlay.
    pub bootstrap_peers: Vec<String>,
    /// PBFT quorum threshold applied to both prepare and commit sets.
    pub quorum: usize,
    pub heartbeat_ms: u64,
    pub failure_sweep_ms: u64,
    pub suspect_after_ms: u64,
    /// Simulated task submitter interval; 0 disables self-proposals.
    pub propose_interval_ms: u64,
    /// How long shutdown waits for in-flight workers before abandoning them.
    pub worker_grace_ms: u64,
    pub runtime: RuntimeKind,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let node_id = random_node_id();
        let storage_path = PathBuf::from("./data").join(&node_id);
        Self {
            node_id,
            storage_path,
            swarm_name: "default-swarm".to_string(),
            http_port: 0,
            ws_port: 0,
            listen_addr: "127.0.0.1:0".to_string(),
            bootstrap_peers: Vec::new(),
            quorum: 2,
            heartbeat_ms: 5_000,
            failure_sweep_ms: 10_000,
            suspect_after_ms: 15_000,
            propose_interval_ms: 15_000,
            worker_grace_ms: 5_000,
            runtime: RuntimeKind::Docker,
            log_level: "info".to_string(),
        }
    }
}

fn random_node_id() -> String {
    format!("node-{}", hex::encode(rand::random::<[u8; 4]>()))
}

fn parse_var<T: std::str::FromStr>(
    key: &'static str,
    reason: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<T>()
                .map(Some)
                .map_err(|_| ConfigError::Invalid {
                    key,
                    value: raw,
                    reason,
                })
        }
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Build a configuration from the process environment, falling back to
    /// defaults per variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        if let Ok(v) = env::var("NODE_ID") {
            if !v.trim().is_empty() {
                cfg.node_id = v.trim().to_string();
                // The default storage path derives from the node id.
                cfg.storage_path = PathBuf::from("./data").join(&cfg.node_id);
            }
        }
        if let Ok(v) = env::var("STORAGE_PATH") {
            if !v.trim().is_empty() {
                cfg.storage_path = PathBuf::from(v.trim());
            }
        }
        if let Ok(v) = env::var("SWARM_NAME") {
            if !v.trim().is_empty() {
                cfg.swarm_name = v.trim().to_string();
            }
        }
        if let Ok(v) = env::var("SWARM_LISTEN") {
            if !v.trim().is_empty() {
                cfg.listen_addr = v.trim().to_string();
            }
        }
        if let Ok(v) = env::var("SWARM_PEERS") {
            cfg.bootstrap_peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(p) = parse_var::<u16>("HTTP_PORT", "expected a port number")? {
            cfg.http_port = p;
        }
        if let Some(p) = parse_var::<u16>("WS_PORT", "expected a port number")? {
            cfg.ws_port = p;
        }

        if let Some(q) = parse_var::<usize>("SWARM_QUORUM", "expected a positive integer")? {
            cfg.quorum = q;
        }
        // f takes precedence: quorum = 2f + 1 tolerates f Byzantine nodes
        // out of at least 3f + 1.
        if let Some(f) =
            parse_var::<usize>("SWARM_FAULT_TOLERANCE", "expected a non-negative integer")?
        {
            cfg.quorum = 2 * f + 1;
        }

        if let Some(v) = parse_var::<u64>("HEARTBEAT_MS", "expected milliseconds")? {
            cfg.heartbeat_ms = v;
        }
        if let Some(v) = parse_var::<u64>("FAILURE_SWEEP_MS", "expected milliseconds")? {
            cfg.failure_sweep_ms = v;
        }
        if let Some(v) = parse_var::<u64>("SUSPECT_AFTER_MS", "expected milliseconds")? {
            cfg.suspect_after_ms = v;
        }
        if let Some(v) = parse_var::<u64>("PROPOSE_INTERVAL_MS", "expected milliseconds")? {
            cfg.propose_interval_ms = v;
        }
        if let Some(v) = parse_var::<u64>("WORKER_GRACE_MS", "expected milliseconds")? {
            cfg.worker_grace_ms = v;
        }

        if let Ok(v) = env::var("RUNTIME") {
            cfg.runtime = match v.trim().to_lowercase().as_str() {
                "" | "docker" => RuntimeKind::Docker,
                "process" => RuntimeKind::Process,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "RUNTIME",
                        value: v,
                        reason: "expected 'docker' or 'process'",
                    })
                }
            };
        }
        if let Ok(v) = env::var("LOG_LEVEL") {
            if !v.trim().is_empty() {
                cfg.log_level = v.trim().to_lowercase();
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quorum == 0 {
            return Err(ConfigError::Invalid {
                key: "SWARM_QUORUM",
                value: "0".into(),
                reason: "quorum must be at least 1",
            });
        }
        if self.heartbeat_ms == 0 || self.failure_sweep_ms == 0 || self.suspect_after_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "HEARTBEAT_MS",
                value: "0".into(),
                reason: "liveness intervals must be nonzero",
            });
        }
        if self.suspect_after_ms <= self.heartbeat_ms {
            return Err(ConfigError::Invalid {
                key: "SUSPECT_AFTER_MS",
                value: self.suspect_after_ms.to_string(),
                reason: "suspect threshold must exceed the heartbeat interval",
            });
        }
        Ok(())
    }
}
