//! Local task supervision
//!
//! The supervisor owns the node's active allocations: it starts a runtime
//! per task when an allocation is placed, polls the runtimes on a fixed
//! cadence, aggregates task states into an allocation status, and tears
//! everything down on a stop directive. Its allocation map is the
//! authoritative record of what is actually running on this node; the
//! control plane learns about it only through heartbeats.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use crate::cluster::models::{
    now_ts, Allocation, AllocationHeartbeat, AllocationStatus, Task, TaskHeartbeat, TaskState,
};

use super::driver::{ContainerDriver, ProcessDriver, TaskDriver, TaskHandle};

/// How often the status monitor polls the runtimes.
pub const MONITOR_INTERVAL_SECS: u64 = 5;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("allocation '{0}' is already placed")]
    AlreadyPlaced(String),

    #[error("allocation '{0}' not found")]
    NotFound(String),
}

/// One task under supervision.
pub struct SupervisedTask {
    pub spec: Task,
    pub state: TaskState,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub exit_code: Option<i64>,
    pub message: Option<String>,
    pub handle: Option<TaskHandle>,
}

/// One allocation under supervision.
pub struct LocalAllocation {
    pub allocation_id: String,
    pub job_id: String,
    pub task_group: String,
    pub status: AllocationStatus,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub tasks: HashMap<String, SupervisedTask>,
}

/// Serializable status view served by `GET /allocations/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct LocalAllocationView {
    pub allocation_id: String,
    pub job_id: String,
    pub task_group: String,
    pub status: AllocationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    pub tasks: HashMap<String, TaskHeartbeat>,
}

/// Aggregate task states into an allocation status: any failed wins, then
/// all-complete, then any-running, else pending.
pub fn aggregate_status(tasks: &HashMap<String, SupervisedTask>) -> AllocationStatus {
    if tasks.is_empty() {
        return AllocationStatus::Pending;
    }
    let any_failed = tasks.values().any(|t| t.state == TaskState::Failed);
    let all_complete = tasks.values().all(|t| t.state == TaskState::Complete);
    let any_running = tasks.values().any(|t| t.state == TaskState::Running);
    if any_failed {
        AllocationStatus::Failed
    } else if all_complete {
        AllocationStatus::Complete
    } else if any_running {
        AllocationStatus::Running
    } else {
        AllocationStatus::Pending
    }
}

pub struct TaskSupervisor {
    allocations: RwLock<HashMap<String, LocalAllocation>>,
    process_driver: Arc<dyn TaskDriver>,
    container_driver: Arc<dyn TaskDriver>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::with_drivers(Arc::new(ProcessDriver), Arc::new(ContainerDriver))
    }

    /// Inject drivers (used by tests and by future runtime variants).
    pub fn with_drivers(
        process_driver: Arc<dyn TaskDriver>,
        container_driver: Arc<dyn TaskDriver>,
    ) -> Self {
        Self {
            allocations: RwLock::new(HashMap::new()),
            process_driver,
            container_driver,
        }
    }

    fn driver_for(&self, task: &Task) -> Arc<dyn TaskDriver> {
        if task.is_container() {
            self.container_driver.clone()
        } else {
            self.process_driver.clone()
        }
    }

    fn driver_for_handle(&self, handle: &TaskHandle) -> Arc<dyn TaskDriver> {
        match handle {
            TaskHandle::Process { .. } => self.process_driver.clone(),
            TaskHandle::Container { .. } => self.container_driver.clone(),
        }
    }

    /// Place an allocation: start a runtime per task. The allocation is
    /// marked running as soon as spawning begins; the monitor demotes it
    /// if the runtime disagrees. Re-placing a live allocation id is
    /// rejected, so one (allocation, task) never owns two runtimes.
    pub async fn place(&self, directive: Allocation) -> Result<(), SupervisorError> {
        let mut allocations = self.allocations.write().await;
        if allocations.contains_key(&directive.allocation_id) {
            return Err(SupervisorError::AlreadyPlaced(directive.allocation_id));
        }

        let mut local = LocalAllocation {
            allocation_id: directive.allocation_id.clone(),
            job_id: directive.job_id.clone(),
            task_group: directive.task_group.name.clone(),
            status: AllocationStatus::Pending,
            start_time: None,
            end_time: None,
            tasks: HashMap::new(),
        };

        for spec in directive.task_group.tasks {
            let driver = self.driver_for(&spec);
            let mut task = SupervisedTask {
                spec,
                state: TaskState::Pending,
                start_time: None,
                end_time: None,
                exit_code: None,
                message: None,
                handle: None,
            };

            match driver.start(&local.allocation_id, &task.spec).await {
                Ok(handle) => {
                    info!(
                        allocation_id = %local.allocation_id,
                        task = %task.spec.name,
                        runtime = %handle.describe(),
                        "task started"
                    );
                    task.state = TaskState::Running;
                    task.start_time = Some(now_ts());
                    task.message = Some(handle.describe());
                    task.handle = Some(handle);
                    local.status = AllocationStatus::Running;
                    local.start_time.get_or_insert_with(now_ts);
                }
                Err(e) => {
                    error!(
                        allocation_id = %local.allocation_id,
                        task = %task.spec.name,
                        error = %e,
                        "task failed to start"
                    );
                    task.state = TaskState::Failed;
                    task.end_time = Some(now_ts());
                    task.message = Some(e.to_string());
                    local.status = AllocationStatus::Failed;
                    local.end_time = Some(now_ts());
                }
            }

            let name = task.spec.name.clone();
            local.tasks.insert(name, task);
        }

        allocations.insert(local.allocation_id.clone(), local);
        Ok(())
    }

    /// Poll every supervised runtime once and refresh allocation
    /// aggregates.
    pub async fn monitor_once(&self) {
        let mut allocations = self.allocations.write().await;
        for allocation in allocations.values_mut() {
            for task in allocation.tasks.values_mut() {
                if task.state.is_terminal() {
                    continue;
                }
                let Some(handle) = task.handle.clone() else {
                    continue;
                };
                let was_running = task.state == TaskState::Running;
                let driver = self.driver_for_handle(&handle);
                match driver.observe(&handle, was_running).await {
                    Ok(Some(observation)) => {
                        task.state = observation.state;
                        if observation.exit_code.is_some() {
                            task.exit_code = observation.exit_code;
                        }
                        if observation.message.is_some() {
                            task.message = observation.message;
                        }
                        if task.state.is_terminal() && task.end_time.is_none() {
                            task.end_time = Some(now_ts());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            allocation_id = %allocation.allocation_id,
                            task = %task.spec.name,
                            error = %e,
                            "runtime poll failed"
                        );
                    }
                }
            }

            let aggregated = aggregate_status(&allocation.tasks);
            allocation.status = aggregated;
            match aggregated {
                AllocationStatus::Running => {
                    allocation.start_time.get_or_insert_with(now_ts);
                }
                AllocationStatus::Failed | AllocationStatus::Complete => {
                    allocation.end_time.get_or_insert_with(now_ts);
                }
                _ => {}
            }
        }
    }

    /// Stop an allocation's tasks and drop it from the active set. The
    /// control plane learns the row is gone on its side; the agent simply
    /// stops reporting it.
    pub async fn stop(&self, allocation_id: &str) -> Result<(), SupervisorError> {
        let mut allocation = {
            let mut allocations = self.allocations.write().await;
            allocations
                .remove(allocation_id)
                .ok_or_else(|| SupervisorError::NotFound(allocation_id.to_string()))?
        };

        info!(%allocation_id, tasks = allocation.tasks.len(), "stopping allocation");
        let stop_futures: Vec<_> = allocation
            .tasks
            .iter()
            .filter_map(|(name, task)| {
                let handle = task.handle.clone()?;
                let driver = self.driver_for_handle(&handle);
                let name = name.clone();
                Some(async move { (name, driver.stop(&handle).await) })
            })
            .collect();

        for (name, result) in futures::future::join_all(stop_futures).await {
            let Some(task) = allocation.tasks.get_mut(&name) else {
                continue;
            };
            match result {
                Ok(()) => {
                    task.state = TaskState::Complete;
                    task.end_time = Some(now_ts());
                }
                Err(e) => {
                    warn!(%allocation_id, task = %name, error = %e, "task stop failed");
                    task.state = TaskState::Failed;
                    task.end_time = Some(now_ts());
                    task.message = Some(e.to_string());
                }
            }
        }
        allocation.status = AllocationStatus::Stopped;
        allocation.end_time = Some(now_ts());
        info!(%allocation_id, "allocation stopped and removed");
        Ok(())
    }

    /// Status view of one allocation.
    pub async fn get(&self, allocation_id: &str) -> Option<LocalAllocationView> {
        let allocations = self.allocations.read().await;
        allocations.get(allocation_id).map(view_of)
    }

    /// Heartbeat payload: every active allocation with per-task states.
    pub async fn snapshot(&self) -> HashMap<String, AllocationHeartbeat> {
        let allocations = self.allocations.read().await;
        allocations
            .iter()
            .map(|(id, allocation)| {
                (
                    id.clone(),
                    AllocationHeartbeat {
                        status: allocation.status,
                        start_time: allocation.start_time,
                        end_time: allocation.end_time,
                        tasks: task_heartbeats(&allocation.tasks),
                    },
                )
            })
            .collect()
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn task_heartbeats(tasks: &HashMap<String, SupervisedTask>) -> HashMap<String, TaskHeartbeat> {
    tasks
        .iter()
        .map(|(name, task)| {
            (
                name.clone(),
                TaskHeartbeat {
                    status: task.state,
                    start_time: task.start_time,
                    end_time: task.end_time,
                    exit_code: task.exit_code,
                    message: task.message.clone(),
                },
            )
        })
        .collect()
}

fn view_of(allocation: &LocalAllocation) -> LocalAllocationView {
    LocalAllocationView {
        allocation_id: allocation.allocation_id.clone(),
        job_id: allocation.job_id.clone(),
        task_group: allocation.task_group.clone(),
        status: allocation.status,
        start_time: allocation.start_time,
        end_time: allocation.end_time,
        tasks: task_heartbeats(&allocation.tasks),
    }
}

/// Start the periodic status monitor. The returned sender stops it.
pub fn spawn_task_monitor(supervisor: Arc<TaskSupervisor>) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        info!(interval_secs = MONITOR_INTERVAL_SECS, "task monitor started");
        let mut ticker =
            tokio::time::interval(Duration::from_secs(MONITOR_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    supervisor.monitor_once().await;
                }
                changed = shutdown_rx.changed() => {
                    // A dropped shutdown handle also stops the monitor.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("task monitor shutting down");
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
    use crate::agent::driver::{DriverError, TaskObservation};
    use crate::cluster::models::TaskGroup;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Driver whose behavior is scripted by the test.
    #[derive(Default)]
    struct ScriptedDriver {
        fail_start: bool,
        next_observation: Mutex<Option<TaskObservation>>,
        stops: AtomicUsize,
    }

    impl ScriptedDriver {
        fn observe_next(&self, observation: TaskObservation) {
            *self.next_observation.lock().unwrap() = Some(observation);
        }
    }

    #[async_trait]
    impl TaskDriver for ScriptedDriver {
        async fn start(
            &self,
            _allocation_id: &str,
            task: &Task,
        ) -> Result<TaskHandle, DriverError> {
            if self.fail_start {
                return Err(DriverError::Spawn("scripted failure".into()));
            }
            Ok(TaskHandle::Container {
                container_id: format!("fake-{}", task.name),
            })
        }

        async fn observe(
            &self,
            _handle: &TaskHandle,
            _was_running: bool,
        ) -> Result<Option<TaskObservation>, DriverError> {
            Ok(self.next_observation.lock().unwrap().clone())
        }

        async fn stop(&self, _handle: &TaskHandle) -> Result<(), DriverError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn group(task_names: &[&str]) -> TaskGroup {
        let tasks: Vec<serde_json::Value> = task_names
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "resources": {"cpu": 100, "memory": 128},
                    "config": {"image": "nginx:latest"}
                })
            })
            .collect();
        serde_json::from_value(json!({"name": "web", "tasks": tasks})).unwrap()
    }

    fn directive(allocation_id: &str, task_names: &[&str]) -> Allocation {
        let mut allocation = Allocation::new("job-1", "node-1", group(task_names));
        allocation.allocation_id = allocation_id.to_string();
        allocation
    }

    fn scripted_supervisor() -> (Arc<ScriptedDriver>, TaskSupervisor) {
        let driver = Arc::new(ScriptedDriver::default());
        let supervisor =
            TaskSupervisor::with_drivers(driver.clone(), driver.clone());
        (driver, supervisor)
    }

    #[tokio::test]
    async fn test_place_marks_running_eagerly() {
        let (_driver, supervisor) = scripted_supervisor();
        supervisor.place(directive("a1", &["nginx"])).await.unwrap();

        let view = supervisor.get("a1").await.unwrap();
        assert_eq!(view.status, AllocationStatus::Running);
        assert_eq!(view.tasks["nginx"].status, TaskState::Running);
        assert!(view.start_time.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_placement_is_rejected() {
        let (_driver, supervisor) = scripted_supervisor();
        supervisor.place(directive("a1", &["nginx"])).await.unwrap();

        let result = supervisor.place(directive("a1", &["nginx"])).await;
        assert!(matches!(result, Err(SupervisorError::AlreadyPlaced(_))));
    }

    #[tokio::test]
    async fn test_start_failure_marks_allocation_failed() {
        let driver = Arc::new(ScriptedDriver {
            fail_start: true,
            ..ScriptedDriver::default()
        });
        let supervisor = TaskSupervisor::with_drivers(driver.clone(), driver);
        supervisor.place(directive("a1", &["nginx"])).await.unwrap();

        let view = supervisor.get("a1").await.unwrap();
        assert_eq!(view.status, AllocationStatus::Failed);
        assert_eq!(view.tasks["nginx"].status, TaskState::Failed);
        assert!(view.tasks["nginx"].message.is_some());
    }

    #[tokio::test]
    async fn test_monitor_demotes_failed_task() {
        let (driver, supervisor) = scripted_supervisor();
        supervisor.place(directive("a1", &["nginx"])).await.unwrap();

        driver.observe_next(TaskObservation {
            state: TaskState::Failed,
            exit_code: Some(137),
            message: Some("container exited with code 137".to_string()),
        });
        supervisor.monitor_once().await;

        let view = supervisor.get("a1").await.unwrap();
        assert_eq!(view.status, AllocationStatus::Failed);
        assert_eq!(view.tasks["nginx"].exit_code, Some(137));
        assert!(view.end_time.is_some());
    }

    #[tokio::test]
    async fn test_monitor_completes_allocation() {
        let (driver, supervisor) = scripted_supervisor();
        supervisor
            .place(directive("a1", &["nginx", "sidecar"]))
            .await
            .unwrap();

        driver.observe_next(TaskObservation {
            state: TaskState::Complete,
            exit_code: Some(0),
            message: None,
        });
        supervisor.monitor_once().await;

        let view = supervisor.get("a1").await.unwrap();
        assert_eq!(view.status, AllocationStatus::Complete);
    }

    #[tokio::test]
    async fn test_stop_removes_from_active_set() {
        let (driver, supervisor) = scripted_supervisor();
        supervisor
            .place(directive("a1", &["nginx", "sidecar"]))
            .await
            .unwrap();

        supervisor.stop("a1").await.unwrap();
        assert_eq!(driver.stops.load(Ordering::SeqCst), 2);
        assert!(supervisor.get("a1").await.is_none());
        assert!(supervisor.snapshot().await.is_empty());

        let result = supervisor.stop("a1").await;
        assert!(matches!(result, Err(SupervisorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_snapshot_shape() {
        let (_driver, supervisor) = scripted_supervisor();
        supervisor.place(directive("a1", &["nginx"])).await.unwrap();

        let snapshot = supervisor.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        let entry = &snapshot["a1"];
        assert_eq!(entry.status, AllocationStatus::Running);
        assert_eq!(entry.tasks.len(), 1);
        assert_eq!(entry.tasks["nginx"].status, TaskState::Running);
    }

    #[test]
    fn test_aggregate_status_priorities() {
        fn task(state: TaskState) -> SupervisedTask {
            SupervisedTask {
                spec: serde_json::from_value(json!({"name": "t", "config": {}})).unwrap(),
                state,
                start_time: None,
                end_time: None,
                exit_code: None,
                message: None,
                handle: None,
            }
        }
        fn tasks(states: &[TaskState]) -> HashMap<String, SupervisedTask> {
            states
                .iter()
                .enumerate()
                .map(|(i, s)| (format!("t{i}"), task(*s)))
                .collect()
        }

        assert_eq!(aggregate_status(&tasks(&[])), AllocationStatus::Pending);
        assert_eq!(
            aggregate_status(&tasks(&[TaskState::Running, TaskState::Failed])),
            AllocationStatus::Failed
        );
        assert_eq!(
            aggregate_status(&tasks(&[TaskState::Complete, TaskState::Complete])),
            AllocationStatus::Complete
        );
        assert_eq!(
            aggregate_status(&tasks(&[TaskState::Running, TaskState::Complete])),
            AllocationStatus::Running
        );
        assert_eq!(
            aggregate_status(&tasks(&[TaskState::Pending, TaskState::Complete])),
            AllocationStatus::Pending
        );
    }
}
