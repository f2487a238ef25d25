//! # swarmd Node Crate
//!
//! One swarmd process: a leaderless cluster member that proposes, votes,
//! decides, and executes.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Node                                   │
//! │                                                                   │
//! │   Overlay (TCP / in-memory) ──frames──► Router                    │
//! │        ▲                                  │  verify Ed25519       │
//! │        │ broadcast                        │  dispatch by type     │
//! │        │                     ┌────────────┼─────────────┐        │
//! │        │                     ▼            ▼             ▼        │
//! │        │              PeerRegistry   ConsensusEngine  (votes)    │
//! │        │                     ▲            │ Decide(op)           │
//! │   FailureDetector ───────────┘            ▼                      │
//! │        │  FAIL_NODE            DecisionApplier ──► Store (LWW)   │
//! │        │                                  │                      │
//! │        ▼                                  │ self-assigned        │
//! │   proposals ◄── SimulatedProposer         ▼                      │
//! │        ▲                         WorkerSupervisor ──► Runtime    │
//! │        └──────── task status ◄────────────┘                      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module          | Responsibility                                        |
//! |-----------------|-------------------------------------------------------|
//! | `transport`     | overlay seam + reference TCP implementation           |
//! | `mem_transport` | in-process overlay hub for tests and demos            |
//! | `registry`      | peer records: labels, keys, last_seen, liveness       |
//! | `router`        | envelope parse, signature gate, per-type dispatch     |
//! | `consensus`     | PBFT-lite three-phase engine (propose/prepare/commit) |
//! | `apply`         | the single decision handler mutating replicated state |
//! | `supervisor`    | container execution for self-assigned tasks           |
//! | `failure`       | heartbeat-silence sweep and FAIL_NODE proposals       |
//! | `policy`        | pluggable scheduling / reassignment policy            |
//! | `proposer`      | simulated periodic task submitter                     |
//! | `handlers`      | read-only axum observability endpoints                |
//! | `node`          | wiring, tickers, shutdown                             |
//!
//! ## Key invariants
//!
//! 1. A message that fails signature verification never reaches consensus
//!    or the registry.
//! 2. The store mutates only inside the decision handler; every mutation
//!    traces back to a DECIDED operation.
//! 3. The decision handler runs at most once per `op_id` per node.
//! 4. Consensus record phases only move forward.

pub mod apply;
pub mod consensus;
pub mod failure;
pub mod handlers;
pub mod mem_transport;
pub mod node;
pub mod policy;
pub mod proposer;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod transport;

pub use apply::{DecisionApplier, TaskLaunch};
pub use consensus::{ConsensusEngine, ConsensusRecord, Effect, Phase};
pub use failure::FailureDetector;
pub use handlers::AppState;
pub use mem_transport::MemoryHub;
pub use node::NodeHandle;
pub use policy::{AssignToSelf, SchedulingPolicy};
pub use proposer::SimulatedProposer;
pub use registry::{HandshakeOutcome, Liveness, PeerRecord, PeerRegistry};
pub use router::Router;
pub use supervisor::WorkerSupervisor;
pub use transport::{Overlay, OverlayEvent, TcpOverlay, TcpOverlayConfig, TransportError};
