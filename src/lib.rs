//! Rudder: a lightweight cluster workload orchestrator.
//!
//! A central control plane ([`cluster`]) accepts resource-bounded jobs,
//! plans them onto registered nodes, dispatches allocations to per-node
//! agents, and continuously reconciles recorded state with what agents
//! report. The agent ([`agent`]) registers its node, heartbeats, and
//! supervises the actual processes and containers. Persistence lives in
//! [`store`].

pub mod agent;
pub mod cli;
pub mod cluster;
pub mod store;
