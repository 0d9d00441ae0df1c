//! Core data model shared by the control plane and the node agent
//!
//! Everything that crosses a process boundary (HTTP bodies, heartbeats,
//! allocation directives) or a storage boundary (store rows) lives here.
//! Status enums serialize as lowercase strings to match the wire and the
//! database representation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Wall-clock timestamp as floating-point seconds since the epoch.
///
/// All persisted and wire timestamps use this representation.
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ============================================================================
// Status enums
// ============================================================================

/// Aggregate status of a job, derived from its allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Submitted but not yet placed
    Pending,
    /// At least one allocation is running
    Running,
    /// Every allocation finished successfully or was stopped
    Complete,
    /// Every allocation failed
    Failed,
    /// Every allocation was lost (node failure)
    Lost,
    /// Explicitly stopped by the user
    Dead,
    /// Some allocations run while others failed or were lost
    Degraded,
    /// Cannot be placed with the resources currently available
    Blocked,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Lost => "lost",
            JobStatus::Dead => "dead",
            JobStatus::Degraded => "degraded",
            JobStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "complete" => Some(JobStatus::Complete),
            "failed" => Some(JobStatus::Failed),
            "lost" => Some(JobStatus::Lost),
            "dead" => Some(JobStatus::Dead),
            "degraded" => Some(JobStatus::Degraded),
            "blocked" => Some(JobStatus::Blocked),
            _ => None,
        }
    }
}

/// Status of a single allocation (one task group on one node).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
    Stopped,
}

impl AllocationStatus {
    /// Terminal statuses are never overwritten by the health sweeper.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AllocationStatus::Complete
                | AllocationStatus::Failed
                | AllocationStatus::Lost
                | AllocationStatus::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Pending => "pending",
            AllocationStatus::Running => "running",
            AllocationStatus::Complete => "complete",
            AllocationStatus::Failed => "failed",
            AllocationStatus::Lost => "lost",
            AllocationStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AllocationStatus::Pending),
            "running" => Some(AllocationStatus::Running),
            "complete" => Some(AllocationStatus::Complete),
            "failed" => Some(AllocationStatus::Failed),
            "lost" => Some(AllocationStatus::Lost),
            "stopped" => Some(AllocationStatus::Stopped),
            _ => None,
        }
    }
}

/// Status of a single task inside an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Complete | TaskState::Failed | TaskState::Lost
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Complete => "complete",
            TaskState::Failed => "failed",
            TaskState::Lost => "lost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskState::Pending),
            "running" => Some(TaskState::Running),
            "complete" => Some(TaskState::Complete),
            "failed" => Some(TaskState::Failed),
            "lost" => Some(TaskState::Lost),
            _ => None,
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        TaskState::Pending
    }
}

/// Outcome of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStatus {
    Pending,
    Complete,
    Failed,
}

/// Event that triggered an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    JobSubmit,
    JobUpdate,
    JobDeregister,
    NodeFailure,
    NodeJoin,
}

// ============================================================================
// Resources
// ============================================================================

/// Resource demand of a single task.
///
/// CPU is measured in tenths of a percent of a virtual core, memory in
/// megabytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResources {
    #[serde(default)]
    pub cpu: i64,
    #[serde(default)]
    pub memory: i64,
}

/// Resources reported by a node.
///
/// `cpu`/`memory` are the amounts currently available; the optional usage
/// percentages feed the advisory resource alarm only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    #[serde(default)]
    pub cpu: i64,
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub cpu_used: i64,
    #[serde(default)]
    pub memory_used: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_usage: Option<f64>,
}

// ============================================================================
// Jobs, task groups, tasks
// ============================================================================

/// A single task: an OS process (`config.command`) or a container
/// (`config.image`, optional `config.port`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub resources: TaskResources,
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

impl Task {
    /// A task is a container task iff its config carries an image.
    pub fn is_container(&self) -> bool {
        self.image().is_some()
    }

    pub fn image(&self) -> Option<&str> {
        self.config.get("image").and_then(Value::as_str)
    }

    pub fn command(&self) -> Option<&str> {
        self.config.get("command").and_then(Value::as_str)
    }

    pub fn port(&self) -> Option<u16> {
        self.config
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
    }
}

/// Constraint operator for task-group placement constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "regex")]
    Regex,
}

/// An attribute/operator/value placement constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub attribute: String,
    pub operator: ConstraintOperator,
    pub value: Value,
}

/// A named set of tasks that land together on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
}

impl TaskGroup {
    /// Total resource demand across all tasks in the group.
    pub fn total_resources(&self) -> TaskResources {
        self.tasks.iter().fold(TaskResources::default(), |acc, t| {
            TaskResources {
                cpu: acc.cpu + t.resources.cpu,
                memory: acc.memory + t.resources.memory,
            }
        })
    }
}

/// Job submission/update payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default)]
    pub task_groups: Vec<TaskGroup>,
    #[serde(default)]
    pub constraints: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
}

/// A stored job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub task_groups: Vec<TaskGroup>,
    #[serde(default)]
    pub constraints: HashMap<String, Value>,
    pub status: JobStatus,
}

impl Job {
    pub fn from_spec(job_id: impl Into<String>, spec: &JobSpec, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            task_groups: spec.task_groups.clone(),
            constraints: spec.constraints.clone(),
            status,
        }
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// A machine running an agent.
///
/// `endpoint` is the agent's inbound directive address, persisted on the
/// node row; in-memory endpoint maps are caches over this field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub ip_address: String,
    pub resources: NodeResources,
    pub healthy: bool,
    #[serde(default)]
    pub last_heartbeat: f64,
    pub endpoint: String,
}

// ============================================================================
// Allocations
// ============================================================================

/// A planned or dispatched allocation: one task group placed on one node.
///
/// This is the value the planner creates and the executor delivers to the
/// agent; it carries the full task-group definition. The store row keeps
/// only the group name (see [`AllocationRow`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub allocation_id: String,
    pub job_id: String,
    pub node_id: String,
    pub task_group: TaskGroup,
    pub status: AllocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
}

impl Allocation {
    /// Create a fresh allocation with a new id, in `pending` state.
    pub fn new(job_id: impl Into<String>, node_id: impl Into<String>, group: TaskGroup) -> Self {
        Self {
            allocation_id: Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            node_id: node_id.into(),
            task_group: group,
            status: AllocationStatus::Pending,
            start_time: None,
            end_time: None,
        }
    }
}

/// An allocation as read back from the store (group by name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRow {
    pub allocation_id: String,
    pub job_id: String,
    pub node_id: String,
    pub task_group: String,
    pub status: AllocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
}

// ============================================================================
// Read views (nested job/node information)
// ============================================================================

/// Per-task detail nested under an allocation in read views.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    pub status: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// An allocation with its per-task breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationDetail {
    pub allocation_id: String,
    pub node_id: String,
    pub task_group: String,
    pub status: AllocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub tasks: HashMap<String, TaskDetail>,
}

/// A job with its allocations nested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    pub job_id: String,
    pub task_groups: Vec<TaskGroup>,
    #[serde(default)]
    pub constraints: HashMap<String, Value>,
    pub status: JobStatus,
    pub allocations: Vec<AllocationDetail>,
}

/// A node with its allocations nested (for `GET /nodes`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDetail {
    #[serde(flatten)]
    pub node: Node,
    pub allocations: Vec<AllocationRow>,
}

// ============================================================================
// Heartbeats
// ============================================================================

/// Per-task status carried in a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHeartbeat {
    pub status: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Per-allocation status carried in a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationHeartbeat {
    pub status: AllocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub tasks: HashMap<String, TaskHeartbeat>,
}

/// Periodic agent report: liveness, resources, and the authoritative view
/// of everything running on the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub resources: NodeResources,
    pub healthy: bool,
    pub timestamp: f64,
    #[serde(default)]
    pub allocations: HashMap<String, AllocationHeartbeat>,
}

// ============================================================================
// Evaluations and plans
// ============================================================================

/// A reconciliation computation over (job spec, existing allocations, node
/// snapshot). The snapshot is held by value so planning cannot race with
/// concurrent store writes.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub id: String,
    pub trigger_event: TriggerEvent,
    pub job: Job,
    pub snapshot: Vec<Node>,
    pub existing_job: Option<Job>,
}

impl Evaluation {
    pub fn new(
        trigger_event: TriggerEvent,
        job: Job,
        snapshot: Vec<Node>,
        existing_job: Option<Job>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            trigger_event,
            job,
            snapshot,
            existing_job,
        }
    }
}

/// The output of planning: allocations to create and allocation ids to
/// remove, applied deletes-first as one unit.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub job_id: String,
    pub creates: Vec<Allocation>,
    pub deletes: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.deletes.is_empty()
    }
}

// ============================================================================
// Job templates
// ============================================================================

/// A stored job specification that can be instantiated via `template_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTemplate {
    pub template_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub task_groups: Vec<TaskGroup>,
    #[serde(default)]
    pub constraints: HashMap<String, Value>,
    pub created_at: f64,
    pub updated_at: f64,
}

/// Template create/update payload.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub task_groups: Vec<TaskGroup>,
    #[serde(default)]
    pub constraints: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn container_task() -> Task {
        serde_json::from_value(json!({
            "name": "nginx",
            "resources": {"cpu": 300, "memory": 512},
            "config": {"image": "nginx:latest", "port": 80}
        }))
        .unwrap()
    }

    #[test]
    fn test_task_kind_detection() {
        let container = container_task();
        assert!(container.is_container());
        assert_eq!(container.image(), Some("nginx:latest"));
        assert_eq!(container.port(), Some(80));

        let process: Task = serde_json::from_value(json!({
            "name": "worker",
            "resources": {"cpu": 100, "memory": 128},
            "config": {"command": "python worker.py"}
        }))
        .unwrap();
        assert!(!process.is_container());
        assert_eq!(process.command(), Some("python worker.py"));
    }

    #[test]
    fn test_group_total_resources() {
        let group: TaskGroup = serde_json::from_value(json!({
            "name": "web",
            "tasks": [
                {"name": "a", "resources": {"cpu": 300, "memory": 512}, "config": {}},
                {"name": "b", "resources": {"cpu": 100, "memory": 256}, "config": {}}
            ]
        }))
        .unwrap();

        let total = group.total_resources();
        assert_eq!(total.cpu, 400);
        assert_eq!(total.memory, 768);
    }

    #[test]
    fn test_status_round_trips() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Complete,
            JobStatus::Failed,
            JobStatus::Lost,
            JobStatus::Dead,
            JobStatus::Degraded,
            JobStatus::Blocked,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);

        let json = serde_json::to_string(&AllocationStatus::Lost).unwrap();
        assert_eq!(json, "\"lost\"");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(AllocationStatus::Stopped.is_terminal());
        assert!(AllocationStatus::Lost.is_terminal());
        assert!(!AllocationStatus::Running.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
    }

    #[test]
    fn test_constraint_operator_wire_format() {
        let c: Constraint = serde_json::from_value(json!({
            "attribute": "ip_address",
            "operator": "regex",
            "value": "^10\\."
        }))
        .unwrap();
        assert_eq!(c.operator, ConstraintOperator::Regex);

        let eq: Constraint =
            serde_json::from_value(json!({"attribute": "node_id", "operator": "=", "value": "n1"}))
                .unwrap();
        assert_eq!(eq.operator, ConstraintOperator::Eq);
    }

    #[test]
    fn test_allocation_new_is_pending_with_fresh_id() {
        let group: TaskGroup =
            serde_json::from_value(json!({"name": "web", "tasks": []})).unwrap();
        let a = Allocation::new("job-1", "node-1", group.clone());
        let b = Allocation::new("job-1", "node-1", group);
        assert_eq!(a.status, AllocationStatus::Pending);
        assert_ne!(a.allocation_id, b.allocation_id);
    }

    #[test]
    fn test_heartbeat_deserialization() {
        let hb: Heartbeat = serde_json::from_value(json!({
            "node_id": "n1",
            "resources": {"cpu": 900, "memory": 4096, "cpu_used": 100, "memory_used": 512},
            "healthy": true,
            "timestamp": 1700000000.5,
            "allocations": {
                "a1": {
                    "status": "running",
                    "start_time": 1700000000.0,
                    "tasks": {
                        "nginx": {"status": "running", "start_time": 1700000000.0}
                    }
                }
            }
        }))
        .unwrap();

        assert_eq!(hb.allocations.len(), 1);
        let alloc = &hb.allocations["a1"];
        assert_eq!(alloc.status, AllocationStatus::Running);
        assert_eq!(alloc.tasks["nginx"].status, TaskState::Running);
    }
}
