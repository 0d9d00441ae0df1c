//! # Rudder Control Plane
//!
//! Everything the central server does lives here: accept jobs, decide
//! where they run, dispatch them to agents, and keep the recorded state in
//! step with what agents actually report.
//!
//! ## Reconciliation pipeline
//!
//! ```text
//! POST /jobs ──▶ Scheduler ──▶ Planner ──▶ plan channel ──▶ Executor ──▶ agents
//!                   │              ▲                            │
//!                   │              │ node snapshot,             │ rows
//!                   ▼              │ existing allocations       ▼
//!               NodeManager ◀──────┴──────────────────── NodeManager
//! ```
//!
//! A submitted or updated job becomes an [`models::Evaluation`]; the
//! [`planner`] diffs desired state against existing allocations over a
//! by-value node snapshot and emits a [`models::Plan`]; the [`executor`]
//! applies it, deletes before creates. Agents report back through
//! heartbeats, which the [`resource_manager`] ingests; the
//! [`node_manager`] derives every job's status from its allocations in
//! one place.
//!
//! The scheduler and executor workers are connected only by a typed
//! channel of immutable plan values; neither holds a reference into the
//! other. Background workers are started explicitly by `spawn_*`
//! functions and stopped through the returned `watch` sender.

pub mod alarm;
pub mod api;
pub mod executor;
pub mod models;
pub mod node_manager;
pub mod planner;
pub mod resource_manager;
pub mod scheduler;
pub mod transport;

pub use api::{create_control_plane_router, ControlPlaneState};
pub use executor::{spawn_executor, Executor};
pub use models::{
    Allocation, AllocationStatus, Evaluation, Heartbeat, Job, JobSpec, JobStatus, Node, Plan,
    TaskGroup, TaskState, TriggerEvent,
};
pub use node_manager::{derive_job_status, NodeManager, StatusCounts};
pub use planner::{plan, PlanOutcome};
pub use resource_manager::{spawn_health_sweeper, ResourceManager, ResourceManagerConfig};
pub use scheduler::{spawn_scheduler, Scheduler};
pub use transport::{AgentTransport, TransportError};

/// Default control-plane API port.
pub const CONTROL_PLANE_PORT: u16 = 8500;
