//! swarmd node entry point.
//!
//! Configuration is environment-only (see `swarmd_common::config`); there
//! are no CLI flags. Exit codes: 0 on a clean shutdown, 1 when keypair,
//! configuration, or overlay bootstrap fails.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn, Level};

use swarmd_common::topic::cluster_topic_hex;
use swarmd_common::{Config, NodeIdentity, RuntimeKind};
use swarmd_node::node::NodeHandle;
use swarmd_node::transport::{TcpOverlay, TcpOverlayConfig};
use swarmd_runtime::{ContainerRuntime, DockerRuntime, ProcessRuntime};
use swarmd_storage::{FileStore, MemoryStore, Store};

fn log_level(raw: &str) -> Level {
    match raw {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level(&config.log_level))
        .with_target(false)
        .init();

    let node = match init(config).await {
        Ok(node) => node,
        Err(e) => {
            error!("startup failed: {:#}", e);
            std::process::exit(1);
        }
    };

    wait_for_signal().await;
    node.stop().await;
}

/// Everything that can fail before the node is running. Any error here is
/// fatal and maps to exit code 1.
async fn init(config: Config) -> anyhow::Result<NodeHandle> {
    info!("═══════════════════════════════════════════════════════════════");
    info!("                        swarmd node                             ");
    info!("═══════════════════════════════════════════════════════════════");
    info!("Node ID:      {}", config.node_id);
    info!("Swarm:        {}", config.swarm_name);
    info!("Storage:      {}", config.storage_path.display());
    info!("Listen:       {}", config.listen_addr);
    info!("Bootstrap:    {:?}", config.bootstrap_peers);
    info!("Quorum:       {}", config.quorum);
    info!("Runtime:      {:?}", config.runtime);
    info!("═══════════════════════════════════════════════════════════════");

    // Step 1: node identity. A node without its key cannot participate.
    let identity = NodeIdentity::load_or_generate(&config.storage_path)
        .context("keypair init failed")?;
    info!("Public key:   {}", identity.public_key_hex());

    // Step 2: replicated store. A broken file backing degrades to memory;
    // peers re-decide the state back over time.
    let store: Arc<dyn Store> = match FileStore::open(&config.storage_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            warn!("file store unavailable ({}), falling back to in-memory", e);
            Arc::new(MemoryStore::new())
        }
    };

    // Step 3: join the cluster topic on the overlay.
    let overlay_cfg = TcpOverlayConfig {
        listen_addr: config.listen_addr.clone(),
        bootstrap_peers: config.bootstrap_peers.clone(),
        topic_hex: cluster_topic_hex(&config.swarm_name),
        public_key_hex: identity.public_key_hex().to_string(),
    };
    let (overlay, overlay_events) = TcpOverlay::start(overlay_cfg)
        .await
        .context("overlay bootstrap failed")?;

    // Step 4: container runtime backend.
    let runtime: Arc<dyn ContainerRuntime> = match config.runtime {
        RuntimeKind::Docker => Arc::new(DockerRuntime::new()),
        RuntimeKind::Process => Arc::new(ProcessRuntime::new()),
    };

    // Step 5: wire and start the node.
    Ok(NodeHandle::start(
        config,
        identity,
        overlay,
        overlay_events,
        store,
        runtime,
    ))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = term.recv() => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    }
}
