//! # Rudder Node Agent
//!
//! One agent runs per node. At startup it loads (or mints) a persistent
//! node id, discovers its local address, and registers with the control
//! plane; failing to register is fatal. It then runs three loops: a
//! heartbeat sender, a task-status monitor, and the inbound directive
//! listener through which the control plane places, queries, and stops
//! allocations.
//!
//! The agent's in-memory allocation map is the authoritative record of
//! what actually runs on the node. The control plane holds its own view
//! and the two reconcile only through heartbeats.

pub mod api;
pub mod driver;
pub mod heartbeat;
pub mod identity;
pub mod metrics;
pub mod supervisor;

pub use api::{create_agent_router, AgentState};
pub use driver::{ContainerDriver, DriverError, ProcessDriver, TaskDriver, TaskHandle};
pub use heartbeat::{spawn_heartbeat, HeartbeatConfig, HEARTBEAT_INTERVAL_SECS};
pub use identity::{load_or_create_node_id, local_ip};
pub use metrics::{new_shared_collector, ResourceCollector, SharedResourceCollector};
pub use supervisor::{spawn_task_monitor, TaskSupervisor, MONITOR_INTERVAL_SECS};

/// Default agent API port.
pub const AGENT_PORT: u16 = 8501;
