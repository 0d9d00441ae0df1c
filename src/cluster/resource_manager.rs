//! Heartbeat ingestion and node health
//!
//! The resource manager stores incoming heartbeats, keeps job statuses in
//! step with what agents report, and runs the periodic sweep that marks
//! stale nodes unhealthy and cascades their allocations to `lost`. A node
//! that heartbeats again after a transient blip upserts itself back to
//! healthy and its reported allocation statuses overwrite the `lost` rows.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::store::StoreError;

use super::alarm::{AlarmManager, AlarmThresholds};
use super::models::Heartbeat;
use super::node_manager::{NodeManager, SweepOutcome};

/// Sweep cadence and heartbeat timeout.
#[derive(Debug, Clone, Copy)]
pub struct ResourceManagerConfig {
    /// Nodes silent for longer than this are marked unhealthy.
    pub heartbeat_timeout_secs: f64,
    /// How often the sweeper wakes.
    pub sweep_interval_secs: u64,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 15.0,
            sweep_interval_secs: 5,
        }
    }
}

pub struct ResourceManager {
    node_manager: Arc<NodeManager>,
    alarms: AlarmManager,
    config: ResourceManagerConfig,
}

impl ResourceManager {
    pub fn new(node_manager: Arc<NodeManager>, config: ResourceManagerConfig) -> Self {
        Self {
            node_manager,
            alarms: AlarmManager::new(AlarmThresholds::default()),
            config,
        }
    }

    pub fn config(&self) -> ResourceManagerConfig {
        self.config
    }

    /// Ingest one heartbeat: advisory alarm check, one storage
    /// transaction, then a status recomputation for every touched job.
    pub fn handle_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), StoreError> {
        debug!(node_id = %heartbeat.node_id, allocations = heartbeat.allocations.len(), "heartbeat received");
        self.alarms
            .handle_heartbeat(&heartbeat.node_id, &heartbeat.resources);

        let affected_jobs = self.node_manager.update_heartbeat(heartbeat)?;
        for job_id in affected_jobs {
            self.node_manager.recompute_job_status(&job_id)?;
        }
        Ok(())
    }

    /// One sweep: mark stale nodes unhealthy, cascade their allocations to
    /// `lost`, recompute the owning jobs.
    pub fn sweep_once(&self) -> Result<SweepOutcome, StoreError> {
        let outcome = self
            .node_manager
            .sweep_expired(self.config.heartbeat_timeout_secs)?;
        if outcome.nodes_marked > 0 {
            warn!(
                nodes = outcome.nodes_marked,
                allocations = outcome.allocations_lost,
                "marked stale nodes unhealthy"
            );
        }
        for job_id in &outcome.affected_jobs {
            self.node_manager.recompute_job_status(job_id)?;
        }
        Ok(outcome)
    }
}

/// Start the health sweeper. The returned sender stops it.
pub fn spawn_health_sweeper(manager: Arc<ResourceManager>) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let interval = Duration::from_secs(manager.config.sweep_interval_secs);

    tokio::spawn(async move {
        info!(
            timeout_secs = manager.config.heartbeat_timeout_secs,
            interval_secs = manager.config.sweep_interval_secs,
            "health sweeper started"
        );
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = manager.sweep_once() {
                        error!(error = %e, "health sweep failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped shutdown handle also stops the sweeper.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("health sweeper shutting down");
                        break;
                    }
                }
            }
        }
    });

    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::models::{
        now_ts, Allocation, AllocationHeartbeat, AllocationStatus, JobSpec, JobStatus, Node,
        NodeResources, TaskGroup, TaskHeartbeat, TaskState,
    };
    use crate::store::Store;
    use rusqlite::params;
    use std::collections::HashMap;

    fn setup() -> (ResourceManager, Arc<NodeManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).unwrap();
        let nm = Arc::new(NodeManager::new(store));
        (
            ResourceManager::new(nm.clone(), ResourceManagerConfig::default()),
            nm,
            dir,
        )
    }

    fn register_node(nm: &NodeManager, node_id: &str) {
        nm.register_node(&Node {
            node_id: node_id.to_string(),
            ip_address: "10.0.0.1".to_string(),
            resources: NodeResources {
                cpu: 1000,
                memory: 4096,
                ..NodeResources::default()
            },
            healthy: true,
            last_heartbeat: 0.0,
            endpoint: "http://10.0.0.1:8501".to_string(),
        })
        .unwrap();
    }

    fn web_group() -> TaskGroup {
        serde_json::from_value(serde_json::json!({
            "name": "web",
            "tasks": [{
                "name": "nginx",
                "resources": {"cpu": 300, "memory": 512},
                "config": {"image": "nginx:latest"}
            }]
        }))
        .unwrap()
    }

    fn running_allocation(nm: &NodeManager, node_id: &str) -> (String, Allocation) {
        let spec: JobSpec = serde_json::from_value(serde_json::json!({
            "task_groups": [{
                "name": "web",
                "tasks": [{
                    "name": "nginx",
                    "resources": {"cpu": 300, "memory": 512},
                    "config": {"image": "nginx:latest"}
                }]
            }]
        }))
        .unwrap();
        let (job_id, _) = nm.submit_job(&spec).unwrap();
        let mut alloc = Allocation::new(&job_id, node_id, web_group());
        alloc.status = AllocationStatus::Running;
        nm.update_allocation(&alloc).unwrap();
        (job_id, alloc)
    }

    fn age_node(nm: &NodeManager, node_id: &str, seconds: f64) {
        let conn = nm.store_conn_for_tests();
        conn.execute(
            "UPDATE nodes SET last_heartbeat = ?1 WHERE node_id = ?2",
            params![now_ts() - seconds, node_id],
        )
        .unwrap();
    }

    fn heartbeat_for(
        node_id: &str,
        allocation_id: &str,
    ) -> Heartbeat {
        Heartbeat {
            node_id: node_id.to_string(),
            resources: NodeResources {
                cpu: 700,
                memory: 3584,
                ..NodeResources::default()
            },
            healthy: true,
            timestamp: now_ts(),
            allocations: HashMap::from([(
                allocation_id.to_string(),
                AllocationHeartbeat {
                    status: AllocationStatus::Running,
                    start_time: Some(now_ts()),
                    end_time: None,
                    tasks: HashMap::from([(
                        "nginx".to_string(),
                        TaskHeartbeat {
                            status: TaskState::Running,
                            start_time: Some(now_ts()),
                            end_time: None,
                            exit_code: None,
                            message: None,
                        },
                    )]),
                },
            )]),
        }
    }

    #[test]
    fn test_heartbeat_keeps_job_running() {
        let (rm, nm, _dir) = setup();
        register_node(&nm, "n1");
        let (job_id, alloc) = running_allocation(&nm, "n1");

        rm.handle_heartbeat(&heartbeat_for("n1", &alloc.allocation_id))
            .unwrap();
        assert_eq!(
            nm.get_job(&job_id).unwrap().unwrap().status,
            JobStatus::Running
        );
    }

    #[test]
    fn test_sweep_cascades_and_recomputes() {
        let (rm, nm, _dir) = setup();
        register_node(&nm, "n1");
        let (job_id, _alloc) = running_allocation(&nm, "n1");
        age_node(&nm, "n1", 120.0);

        let outcome = rm.sweep_once().unwrap();
        assert_eq!(outcome.nodes_marked, 1);
        assert_eq!(outcome.allocations_lost, 1);

        assert!(!nm.get_node("n1").unwrap().unwrap().healthy);
        assert_eq!(
            nm.get_job(&job_id).unwrap().unwrap().status,
            JobStatus::Lost
        );
    }

    #[test]
    fn test_degraded_when_one_of_two_nodes_dies() {
        let (rm, nm, _dir) = setup();
        register_node(&nm, "n1");
        register_node(&nm, "n2");

        // One job with an allocation on each node.
        let spec: JobSpec = serde_json::from_value(serde_json::json!({
            "task_groups": [
                {"name": "a", "tasks": [{"name": "t", "resources": {"cpu": 100, "memory": 128}, "config": {}}]},
                {"name": "b", "tasks": [{"name": "t", "resources": {"cpu": 100, "memory": 128}, "config": {}}]}
            ]
        }))
        .unwrap();
        let (job_id, _) = nm.submit_job(&spec).unwrap();
        let group_a: TaskGroup = serde_json::from_value(serde_json::json!(
            {"name": "a", "tasks": [{"name": "t", "resources": {"cpu": 100, "memory": 128}, "config": {}}]}
        ))
        .unwrap();
        let group_b: TaskGroup = serde_json::from_value(serde_json::json!(
            {"name": "b", "tasks": [{"name": "t", "resources": {"cpu": 100, "memory": 128}, "config": {}}]}
        ))
        .unwrap();
        let mut a = Allocation::new(&job_id, "n1", group_a);
        a.status = AllocationStatus::Running;
        nm.update_allocation(&a).unwrap();
        let mut b = Allocation::new(&job_id, "n2", group_b);
        b.status = AllocationStatus::Running;
        nm.update_allocation(&b).unwrap();

        age_node(&nm, "n2", 120.0);
        rm.sweep_once().unwrap();

        assert_eq!(
            nm.get_job(&job_id).unwrap().unwrap().status,
            JobStatus::Degraded
        );
    }

    #[test]
    fn test_late_heartbeat_self_heals() {
        let (rm, nm, _dir) = setup();
        register_node(&nm, "n1");
        let (job_id, alloc) = running_allocation(&nm, "n1");

        age_node(&nm, "n1", 120.0);
        rm.sweep_once().unwrap();
        assert_eq!(
            nm.get_job(&job_id).unwrap().unwrap().status,
            JobStatus::Lost
        );

        // The agent was only partitioned; its next heartbeat restores both
        // the node and the allocation it still runs.
        rm.handle_heartbeat(&heartbeat_for("n1", &alloc.allocation_id))
            .unwrap();

        assert!(nm.get_node("n1").unwrap().unwrap().healthy);
        assert_eq!(
            nm.get_job(&job_id).unwrap().unwrap().status,
            JobStatus::Running
        );
    }
}
