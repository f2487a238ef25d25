//! Node wiring: builds every component around the injected seams (overlay,
//! store, runtime), spawns the long-lived loops, and owns cooperative
//! shutdown.
//!
//! Loops spawned per node:
//! 1. the core loop (overlay events + local proposals),
//! 2. the heartbeat ticker,
//! 3. the failure-detector sweep,
//! 4. the simulated proposer (when enabled),
//! 5. the worker supervisor,
//! 6. the observability server (when enabled).
//!
//! All of them stop on one shared `Notify`; the supervisor additionally
//! grants in-flight workers a bounded grace period.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex as PlMutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use swarmd_common::{now_millis, Config, NodeIdentity, OpBody, Operation};
use swarmd_runtime::ContainerRuntime;
use swarmd_storage::Store;

use crate::apply::DecisionApplier;
use crate::consensus::ConsensusEngine;
use crate::failure::FailureDetector;
use crate::handlers::{self, AppState};
use crate::policy::{AssignToSelf, SchedulingPolicy};
use crate::proposer::SimulatedProposer;
use crate::registry::PeerRegistry;
use crate::router::Router;
use crate::supervisor::WorkerSupervisor;
use crate::transport::{Overlay, OverlayEvent};

/// A running node. Dropping the handle does not stop it; call
/// [`NodeHandle::stop`].
pub struct NodeHandle {
    pub node_id: String,
    pub public_key: String,
    pub registry: Arc<PeerRegistry>,
    pub store: Arc<dyn Store>,
    pub engine: Arc<PlMutex<ConsensusEngine>>,
    proposals: mpsc::UnboundedSender<OpBody>,
    shutdown: Arc<Notify>,
    overlay: Arc<dyn Overlay>,
    handles: PlMutex<Vec<JoinHandle<()>>>,
    grace_ms: u64,
}

impl NodeHandle {
    /// Build and start a node over the given seams. The overlay is already
    /// joined to the cluster topic; its event stream is consumed here.
    pub fn start(
        config: Config,
        identity: NodeIdentity,
        overlay: Arc<dyn Overlay>,
        overlay_events: mpsc::UnboundedReceiver<OverlayEvent>,
        store: Arc<dyn Store>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> NodeHandle {
        let identity = Arc::new(identity);
        let node_id = config.node_id.clone();
        let public_key = identity.public_key_hex().to_string();
        let shutdown = Arc::new(Notify::new());

        let registry = Arc::new(PeerRegistry::new());
        let engine = Arc::new(PlMutex::new(ConsensusEngine::new(
            node_id.clone(),
            config.quorum,
        )));
        let policy: Arc<dyn SchedulingPolicy> = Arc::new(AssignToSelf::new(node_id.clone()));

        let (launch_tx, launch_rx) = mpsc::unbounded_channel();
        let (proposal_tx, proposal_rx) = mpsc::unbounded_channel();

        let applier = Arc::new(DecisionApplier::new(
            node_id.clone(),
            store.clone(),
            registry.clone(),
            launch_tx,
        ));
        let router = Arc::new(Router::new(
            identity.clone(),
            node_id.clone(),
            registry.clone(),
            engine.clone(),
            applier,
            overlay.clone(),
        ));

        let mut handles = Vec::new();

        handles.push(spawn_core_loop(
            node_id.clone(),
            router.clone(),
            engine.clone(),
            overlay_events,
            proposal_rx,
            shutdown.clone(),
        ));

        handles.push(spawn_heartbeat(
            router.clone(),
            config.heartbeat_ms,
            shutdown.clone(),
        ));

        let detector = Arc::new(FailureDetector::new(
            node_id.clone(),
            registry.clone(),
            store.clone(),
            policy.clone(),
            proposal_tx.clone(),
            config.failure_sweep_ms,
            config.suspect_after_ms,
            config.failure_sweep_ms,
            shutdown.clone(),
        ));
        handles.push(detector.start());

        if config.propose_interval_ms > 0 {
            let proposer = Arc::new(SimulatedProposer::new(
                node_id.clone(),
                policy,
                proposal_tx.clone(),
                config.propose_interval_ms,
                shutdown.clone(),
            ));
            handles.push(proposer.start());
        }

        let supervisor = Arc::new(WorkerSupervisor::new(
            node_id.clone(),
            runtime,
            proposal_tx.clone(),
            shutdown.clone(),
            config.worker_grace_ms,
        ));
        handles.push(supervisor.start(launch_rx));

        if config.http_port > 0 {
            let state = Arc::new(AppState {
                node_id: node_id.clone(),
                public_key: public_key.clone(),
                swarm_name: config.swarm_name.clone(),
                started_at: now_millis(),
                registry: registry.clone(),
                store: store.clone(),
                engine: engine.clone(),
                auth_failures: router.auth_failures(),
            });
            let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
            let http_shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                handlers::serve(addr, state, http_shutdown).await;
            }));
        }

        info!(node = %node_id, quorum = config.quorum, "node started");

        NodeHandle {
            node_id,
            public_key,
            registry,
            store,
            engine,
            proposals: proposal_tx,
            shutdown,
            overlay,
            handles: PlMutex::new(handles),
            grace_ms: config.worker_grace_ms,
        }
    }

    /// Submit an operation body for consensus as if it originated locally.
    pub fn propose(&self, body: OpBody) {
        let _ = self.proposals.send(body);
    }

    /// Cooperative shutdown: stop the tickers, close the overlay, then give
    /// the remaining tasks (workers included) a bounded grace period.
    pub async fn stop(&self) {
        info!(node = %self.node_id, "shutting down");
        self.shutdown.notify_waiters();
        self.overlay.shutdown().await;

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let grace = Duration::from_millis(self.grace_ms.saturating_mul(2).max(1_000));
        for handle in handles {
            if timeout(grace, handle).await.is_err() {
                warn!(node = %self.node_id, "task did not stop within grace, abandoning");
            }
        }
        info!(node = %self.node_id, "shutdown complete");
    }
}

fn spawn_core_loop(
    node_id: String,
    router: Arc<Router>,
    engine: Arc<PlMutex<ConsensusEngine>>,
    mut overlay_events: mpsc::UnboundedReceiver<OverlayEvent>,
    mut proposals: mpsc::UnboundedReceiver<OpBody>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,

                maybe = overlay_events.recv() => match maybe {
                    Some(OverlayEvent::PeerUp { pk }) => {
                        debug!(peer = %pk, "overlay peer up, sending handshake");
                        router.send_handshake(&pk).await;
                    }
                    Some(OverlayEvent::Frame { pk, bytes }) => {
                        router.handle_frame(&pk, &bytes).await;
                    }
                    Some(OverlayEvent::PeerDown { pk }) => {
                        // Liveness is judged by heartbeats, not streams; the
                        // dialer may bring the link straight back.
                        debug!(peer = %pk, "overlay peer down");
                    }
                    None => break,
                },

                maybe = proposals.recv() => match maybe {
                    Some(body) => {
                        let now = now_millis();
                        let op = Operation::new(node_id.clone(), now, body);
                        let effects = engine.lock().propose(op, now);
                        router.execute_effects(effects).await;
                    }
                    None => break,
                },
            }
        }
        debug!("core loop stopped");
    })
}

fn spawn_heartbeat(
    router: Arc<Router>,
    interval_ms: u64,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = sleep(Duration::from_millis(interval_ms)) => {
                    router.broadcast_heartbeat().await;
                }
            }
        }
    })
}
