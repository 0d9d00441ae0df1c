//! Placement planner
//!
//! A stateless decision function over (job spec, existing allocations, node
//! snapshot) producing a plan: allocations to create and allocation ids to
//! delete. The planner never touches the store; applying the plan is the
//! executor's job.
//!
//! Resource accounting happens on a working copy of the node snapshot, so
//! two task groups placed within one evaluation cannot over-book a node.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use super::models::{
    Allocation, AllocationRow, Constraint, ConstraintOperator, Evaluation, Node, Plan, TaskGroup,
    TriggerEvent,
};

/// The planner's verdict: the plan itself plus whether every task group of
/// the spec was covered. Failed plans are returned for inspection but must
/// not be applied.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: Plan,
    pub success: bool,
}

/// Produce a plan for one evaluation.
pub fn plan(evaluation: &Evaluation, existing: &[AllocationRow]) -> PlanOutcome {
    let job = &evaluation.job;
    let mut snapshot: Vec<Node> = evaluation.snapshot.clone();
    let mut creates: Vec<Allocation> = Vec::new();
    let mut deletes: Vec<String> = Vec::new();

    // A job with work to place needs at least one healthy node.
    if !job.task_groups.is_empty() && !snapshot.iter().any(|n| n.healthy) {
        debug!(job_id = %job.job_id, "no healthy nodes available");
        return PlanOutcome {
            plan: Plan {
                job_id: job.job_id.clone(),
                creates,
                deletes,
            },
            success: false,
        };
    }

    let mut existing_by_group: HashMap<String, AllocationRow> = existing
        .iter()
        .map(|row| (row.task_group.clone(), row.clone()))
        .collect();
    let mut covered: HashSet<String> = HashSet::new();

    for group in &job.task_groups {
        let mut kept = false;

        // On an update, try to keep the group's existing allocation first.
        if evaluation.trigger_event == TriggerEvent::JobUpdate {
            if let (Some(row), Some(existing_job)) = (
                existing_by_group.get(&group.name),
                evaluation.existing_job.as_ref(),
            ) {
                let previous = existing_job
                    .task_groups
                    .iter()
                    .find(|g| g.name == group.name);
                let changed = previous.map(|p| tasks_changed(p, group)).unwrap_or(true);

                let node_still_fits = snapshot
                    .iter()
                    .find(|n| n.node_id == row.node_id)
                    .map(|n| is_feasible(n, group))
                    .unwrap_or(false);

                if !changed && node_still_fits {
                    debug!(
                        job_id = %job.job_id,
                        group = %group.name,
                        node_id = %row.node_id,
                        "keeping existing allocation"
                    );
                    reserve(&mut snapshot, &row.node_id, group);
                    covered.insert(group.name.clone());
                    kept = true;
                } else {
                    debug!(
                        job_id = %job.job_id,
                        group = %group.name,
                        allocation_id = %row.allocation_id,
                        changed,
                        "replacing existing allocation"
                    );
                    deletes.push(row.allocation_id.clone());
                    existing_by_group.remove(&group.name);
                }
            }
        }

        if kept {
            continue;
        }

        let mut feasible: Vec<usize> = snapshot
            .iter()
            .enumerate()
            .filter(|(_, n)| is_feasible(n, group))
            .map(|(i, _)| i)
            .collect();
        if feasible.is_empty() {
            debug!(job_id = %job.job_id, group = %group.name, "no feasible node");
            continue;
        }

        // Rank by remaining (cpu, memory) descending; ties keep list order.
        feasible.sort_by(|&a, &b| {
            let ra = &snapshot[a].resources;
            let rb = &snapshot[b].resources;
            (rb.cpu, rb.memory).cmp(&(ra.cpu, ra.memory))
        });
        let chosen = feasible[0];
        let node_id = snapshot[chosen].node_id.clone();

        let allocation = Allocation::new(&job.job_id, &node_id, group.clone());
        debug!(
            job_id = %job.job_id,
            group = %group.name,
            %node_id,
            allocation_id = %allocation.allocation_id,
            "planned new allocation"
        );
        creates.push(allocation);
        reserve(&mut snapshot, &node_id, group);
        covered.insert(group.name.clone());
    }

    // Allocations for task groups dropped from the spec are deleted.
    let current_groups: HashSet<&str> = job.task_groups.iter().map(|g| g.name.as_str()).collect();
    for (name, row) in &existing_by_group {
        if !current_groups.contains(name.as_str()) {
            debug!(
                job_id = %job.job_id,
                group = %name,
                allocation_id = %row.allocation_id,
                "task group dropped from spec"
            );
            deletes.push(row.allocation_id.clone());
        }
    }

    let success = covered.len() == job.task_groups.len();
    PlanOutcome {
        plan: Plan {
            job_id: job.job_id.clone(),
            creates,
            deletes,
        },
        success,
    }
}

/// Subtract a group's total demand from a node in the working snapshot.
fn reserve(snapshot: &mut [Node], node_id: &str, group: &TaskGroup) {
    if let Some(node) = snapshot.iter_mut().find(|n| n.node_id == node_id) {
        let demand = group.total_resources();
        node.resources.cpu -= demand.cpu;
        node.resources.memory -= demand.memory;
    }
}

/// Whether a node can host a task group: healthy, every group constraint
/// holds, and remaining cpu and memory each cover the group's demand.
fn is_feasible(node: &Node, group: &TaskGroup) -> bool {
    if !node.healthy {
        return false;
    }
    if !group.constraints.iter().all(|c| constraint_holds(node, c)) {
        return false;
    }
    let need = group.total_resources();
    node.resources.cpu >= need.cpu && node.resources.memory >= need.memory
}

/// Evaluate one constraint against a node attribute. A missing attribute
/// fails the constraint.
fn constraint_holds(node: &Node, constraint: &Constraint) -> bool {
    let Some(attr) = node_attribute(node, &constraint.attribute) else {
        return false;
    };
    match constraint.operator {
        ConstraintOperator::Eq => stringify(&attr) == stringify(&constraint.value),
        ConstraintOperator::Ne => stringify(&attr) != stringify(&constraint.value),
        ConstraintOperator::Gt => match (attr.as_f64(), constraint.value.as_f64()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ConstraintOperator::Lt => match (attr.as_f64(), constraint.value.as_f64()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        ConstraintOperator::Regex => match Regex::new(&stringify(&constraint.value)) {
            Ok(re) => re.is_match(&stringify(&attr)),
            Err(_) => false,
        },
    }
}

/// Node attributes visible to constraints.
fn node_attribute(node: &Node, attribute: &str) -> Option<Value> {
    match attribute {
        "node_id" => Some(Value::String(node.node_id.clone())),
        "ip_address" => Some(Value::String(node.ip_address.clone())),
        "endpoint" => Some(Value::String(node.endpoint.clone())),
        "healthy" => Some(Value::Bool(node.healthy)),
        "cpu" => Some(node.resources.cpu.into()),
        "memory" => Some(node.resources.memory.into()),
        _ => None,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Whether a task group's task list changed between two revisions: count,
/// name set, or any same-named task's resources or config (structural
/// comparison of the two maps).
pub fn tasks_changed(previous: &TaskGroup, current: &TaskGroup) -> bool {
    if previous.tasks.len() != current.tasks.len() {
        return true;
    }
    let old: HashMap<&str, _> = previous.tasks.iter().map(|t| (t.name.as_str(), t)).collect();
    let new: HashMap<&str, _> = current.tasks.iter().map(|t| (t.name.as_str(), t)).collect();
    if old.keys().collect::<HashSet<_>>() != new.keys().collect::<HashSet<_>>() {
        return true;
    }
    for (name, old_task) in &old {
        let new_task = new[name];
        if old_task.resources != new_task.resources || old_task.config != new_task.config {
            return true;
        }
    }
    false
}
