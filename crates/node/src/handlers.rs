//! Read-only HTTP observability (axum).
//!
//! The node takes no instructions over HTTP: task submission is internal
//! and every state change rides consensus. These endpoints exist so an
//! operator (or the deployment harness) can watch a node without attaching
//! a debugger:
//!
//! - `GET /health`  liveness + quorum reachability (200 / 503)
//! - `GET /status`  identity, uptime, consensus counters
//! - `GET /peers`   peer registry snapshot
//! - `GET /tasks`   replicated task records
//!
//! Served on `HTTP_PORT` when nonzero; `WS_PORT` remains reserved.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use swarmd_common::{now_millis, task_key, TaskRecord};
use swarmd_storage::Store;

use crate::consensus::ConsensusEngine;
use crate::registry::{PeerRecord, PeerRegistry};

pub struct AppState {
    pub node_id: String,
    pub public_key: String,
    pub swarm_name: String,
    pub started_at: u64,
    pub registry: Arc<PeerRegistry>,
    pub store: Arc<dyn Store>,
    pub engine: Arc<Mutex<ConsensusEngine>>,
    pub auth_failures: Arc<RwLock<HashMap<String, u64>>>,
}

#[derive(Debug, Serialize)]
pub struct HealthResp {
    pub healthy: bool,
    pub node_id: String,
    pub live_peers: usize,
    pub quorum: usize,
    /// Whether live peers plus this node can still reach quorum.
    pub quorum_reachable: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResp {
    pub node_id: String,
    pub public_key: String,
    pub swarm: String,
    pub uptime_secs: u64,
    pub peers: usize,
    pub tasks: usize,
    pub pending_ops: usize,
    pub decided_ops: u64,
    pub auth_failures_total: u64,
}

#[derive(Debug, Serialize)]
pub struct PeersResp {
    pub count: usize,
    pub peers: Vec<PeerRecord>,
}

#[derive(Debug, Serialize)]
pub struct TaskEntry {
    pub task_id: String,
    #[serde(flatten)]
    pub record: TaskRecord,
}

#[derive(Debug, Serialize)]
pub struct TasksResp {
    pub count: usize,
    pub tasks: Vec<TaskEntry>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/peers", get(peers))
        .route("/tasks", get(tasks))
        .with_state(state)
}

/// Serve until `shutdown` fires. Bind failures are logged, not fatal: the
/// node keeps running without observability.
pub async fn serve(addr: SocketAddr, state: Arc<AppState>, shutdown: Arc<Notify>) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(%addr, "observability server failed to bind: {}", e);
            return;
        }
    };
    info!(%addr, "observability endpoints available");

    let app = build_router(state);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
        })
        .await;
    if let Err(e) = result {
        warn!("observability server error: {}", e);
    }
}

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResp>) {
    let live_peers = state.registry.live_ids().len();
    let quorum = state.engine.lock().quorum();
    let quorum_reachable = live_peers + 1 >= quorum;

    let resp = HealthResp {
        healthy: quorum_reachable,
        node_id: state.node_id.clone(),
        live_peers,
        quorum,
        quorum_reachable,
    };
    let code = if resp.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(resp))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResp> {
    let (pending_ops, decided_ops) = {
        let engine = state.engine.lock();
        (engine.pending_count(), engine.decided_count())
    };
    let auth_failures_total = state.auth_failures.read().values().sum();
    let tasks = state
        .store
        .range(&task_key(""))
        .map(|entries| entries.len())
        .unwrap_or(0);

    Json(StatusResp {
        node_id: state.node_id.clone(),
        public_key: state.public_key.clone(),
        swarm: state.swarm_name.clone(),
        uptime_secs: now_millis().saturating_sub(state.started_at) / 1000,
        peers: state.registry.len(),
        tasks,
        pending_ops,
        decided_ops,
        auth_failures_total,
    })
}

async fn peers(State(state): State<Arc<AppState>>) -> Json<PeersResp> {
    let peers = state.registry.snapshot();
    Json(PeersResp {
        count: peers.len(),
        peers,
    })
}

async fn tasks(State(state): State<Arc<AppState>>) -> Json<TasksResp> {
    let entries = state.store.range(&task_key("")).unwrap_or_default();
    let tasks: Vec<TaskEntry> = entries
        .into_iter()
        .filter_map(|(key, value)| {
            let record: TaskRecord = serde_json::from_value(value).ok()?;
            Some(TaskEntry {
                task_id: key.trim_start_matches("tasks/").to_string(),
                record,
            })
        })
        .collect();
    Json(TasksResp {
        count: tasks.len(),
        tasks,
    })
}
