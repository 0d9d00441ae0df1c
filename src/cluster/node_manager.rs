//! Typed operations over the store
//!
//! The `NodeManager` is the only component that writes the store. It
//! enforces the data-model invariants at write time (task-status rows only
//! for live allocations, cascade deletes, job status as a pure function of
//! allocation statuses) and exposes the read views the HTTP layer serves.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{Store, StoreError};

use super::models::{
    now_ts, Allocation, AllocationDetail, AllocationRow, AllocationStatus, Heartbeat, Job,
    JobDetail, JobSpec, JobStatus, JobTemplate, Node, NodeDetail, TaskDetail, TaskState,
    TemplateSpec,
};

/// Allocation counts by status, the input to job-status derivation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub complete: usize,
    pub failed: usize,
    pub lost: usize,
    pub stopped: usize,
}

impl StatusCounts {
    pub fn from_rows(rows: &[AllocationRow]) -> Self {
        let mut counts = StatusCounts::default();
        for row in rows {
            match row.status {
                AllocationStatus::Pending => counts.pending += 1,
                AllocationStatus::Running => counts.running += 1,
                AllocationStatus::Complete => counts.complete += 1,
                AllocationStatus::Failed => counts.failed += 1,
                AllocationStatus::Lost => counts.lost += 1,
                AllocationStatus::Stopped => counts.stopped += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.complete + self.failed + self.lost + self.stopped
    }
}

/// Derive a job's status from its allocation counts.
///
/// Returns `None` when the status should be left unchanged (no allocations,
/// or a mix this function does not classify). `sufficient` is consulted
/// only for the pending-vs-blocked distinction, so callers can defer the
/// resource check until it is actually needed.
pub fn derive_job_status(
    counts: &StatusCounts,
    sufficient: impl FnOnce() -> bool,
) -> Option<JobStatus> {
    let total = counts.total();
    if total == 0 {
        return None;
    }
    if counts.lost == total {
        return Some(JobStatus::Lost);
    }
    if counts.failed == total {
        return Some(JobStatus::Failed);
    }
    if counts.running > 0 {
        if counts.failed > 0 || counts.lost > 0 {
            return Some(JobStatus::Degraded);
        }
        return Some(JobStatus::Running);
    }
    if counts.pending == total {
        return Some(if sufficient() {
            JobStatus::Pending
        } else {
            JobStatus::Blocked
        });
    }
    if counts.complete + counts.stopped == total {
        return Some(JobStatus::Complete);
    }
    None
}

/// Result of one health sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    pub nodes_marked: usize,
    pub allocations_lost: usize,
    pub affected_jobs: Vec<String>,
}

pub struct NodeManager {
    store: Store,
}

impl NodeManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Upsert a node. Registration always marks the node healthy and
    /// refreshes its heartbeat timestamp.
    pub fn register_node(&self, node: &Node) -> Result<(), StoreError> {
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO nodes (node_id, ip_address, resources, healthy, last_heartbeat, endpoint)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)",
            params![
                node.node_id,
                node.ip_address,
                serde_json::to_string(&node.resources)?,
                now_ts(),
                node.endpoint,
            ],
        )?;
        info!(node_id = %node.node_id, ip = %node.ip_address, "node registered");
        Ok(())
    }

    /// Ingest a heartbeat in a single transaction: node row, then every
    /// carried allocation status, then every nested task status. Returns
    /// the ids of jobs whose allocations were touched, for recomputation.
    ///
    /// Allocations the store no longer knows are skipped; a heartbeat never
    /// resurrects deleted rows.
    pub fn update_heartbeat(&self, hb: &Heartbeat) -> Result<Vec<String>, StoreError> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE nodes SET resources = ?1, healthy = ?2, last_heartbeat = ?3 WHERE node_id = ?4",
            params![
                serde_json::to_string(&hb.resources)?,
                hb.healthy as i64,
                hb.timestamp,
                hb.node_id,
            ],
        )?;

        let mut affected_jobs: Vec<String> = Vec::new();
        for (allocation_id, alloc) in &hb.allocations {
            let job_id: Option<String> = tx
                .query_row(
                    "SELECT job_id FROM allocations WHERE allocation_id = ?1",
                    params![allocation_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(job_id) = job_id else {
                debug!(%allocation_id, "heartbeat carries unknown allocation, skipping");
                continue;
            };

            tx.execute(
                "UPDATE allocations SET status = ?1, start_time = ?2, end_time = ?3, last_update = ?4
                 WHERE allocation_id = ?5",
                params![
                    alloc.status.as_str(),
                    alloc.start_time,
                    alloc.end_time,
                    hb.timestamp,
                    allocation_id,
                ],
            )?;

            for (task_name, task) in &alloc.tasks {
                tx.execute(
                    "INSERT INTO task_status
                     (allocation_id, task_name, status, start_time, end_time, exit_code, last_update, message)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(allocation_id, task_name) DO UPDATE SET
                         status = excluded.status,
                         start_time = excluded.start_time,
                         end_time = excluded.end_time,
                         exit_code = excluded.exit_code,
                         last_update = excluded.last_update,
                         message = excluded.message",
                    params![
                        allocation_id,
                        task_name,
                        task.status.as_str(),
                        task.start_time,
                        task.end_time,
                        task.exit_code,
                        hb.timestamp,
                        task.message,
                    ],
                )?;
            }

            if !affected_jobs.contains(&job_id) {
                affected_jobs.push(job_id);
            }
        }

        tx.commit()?;
        Ok(affected_jobs)
    }

    pub fn list_healthy_nodes(&self) -> Result<Vec<Node>, StoreError> {
        self.query_nodes("SELECT node_id, ip_address, resources, healthy, last_heartbeat, endpoint FROM nodes WHERE healthy = 1")
    }

    pub fn get_all_nodes(&self) -> Result<Vec<Node>, StoreError> {
        self.query_nodes("SELECT node_id, ip_address, resources, healthy, last_heartbeat, endpoint FROM nodes")
    }

    pub fn get_node(&self, node_id: &str) -> Result<Option<Node>, StoreError> {
        let conn = self.store.conn()?;
        let row = conn
            .query_row(
                "SELECT node_id, ip_address, resources, healthy, last_heartbeat, endpoint
                 FROM nodes WHERE node_id = ?1",
                params![node_id],
                Self::node_row,
            )
            .optional()?;
        row.map(Self::node_from_raw).transpose()
    }

    /// All nodes with their allocations nested, for `GET /nodes`.
    pub fn get_nodes_with_allocations(&self) -> Result<Vec<NodeDetail>, StoreError> {
        let nodes = self.get_all_nodes()?;
        let mut details = Vec::with_capacity(nodes.len());
        for node in nodes {
            let allocations = self.get_node_allocations(&node.node_id)?;
            details.push(NodeDetail { node, allocations });
        }
        Ok(details)
    }

    pub fn get_node_allocations(&self, node_id: &str) -> Result<Vec<AllocationRow>, StoreError> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT allocation_id, job_id, node_id, task_group, status, start_time, end_time
             FROM allocations WHERE node_id = ?1",
        )?;
        let raw: Vec<RawAllocation> = stmt
            .query_map(params![node_id], Self::allocation_row)?
            .collect::<Result<_, _>>()?;
        raw.into_iter().map(Self::allocation_from_raw).collect()
    }

    fn query_nodes(&self, sql: &str) -> Result<Vec<Node>, StoreError> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let raw: Vec<RawNode> = stmt
            .query_map([], Self::node_row)?
            .collect::<Result<_, _>>()?;
        raw.into_iter().map(Self::node_from_raw).collect()
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Upsert the job row. Existing jobs keep their current status; new
    /// jobs start at `pending`. Returns `(job_id, is_update)`.
    pub fn submit_job(&self, spec: &JobSpec) -> Result<(String, bool), StoreError> {
        let conn = self.store.conn()?;
        let job_id = spec
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let existing: Option<String> = conn
            .query_row(
                "SELECT status FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        let is_update = existing.is_some();
        let status = existing
            .as_deref()
            .and_then(JobStatus::parse)
            .unwrap_or(JobStatus::Pending);

        conn.execute(
            "INSERT OR REPLACE INTO jobs (job_id, task_groups, constraints, status)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                job_id,
                serde_json::to_string(&spec.task_groups)?,
                serde_json::to_string(&spec.constraints)?,
                status.as_str(),
            ],
        )?;
        info!(%job_id, update = is_update, "job persisted");
        Ok((job_id, is_update))
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.store.conn()?;
        let raw: Option<RawJob> = conn
            .query_row(
                "SELECT job_id, task_groups, constraints, status FROM jobs WHERE job_id = ?1",
                params![job_id],
                Self::job_row,
            )
            .optional()?;
        raw.map(Self::job_from_raw).transpose()
    }

    /// A job with nested allocations and per-task statuses.
    pub fn get_job_info(&self, job_id: &str) -> Result<Option<JobDetail>, StoreError> {
        let Some(job) = self.get_job(job_id)? else {
            return Ok(None);
        };
        Ok(Some(self.job_detail(job)?))
    }

    /// Every job with nested allocations and per-task statuses.
    pub fn get_all_jobs(&self) -> Result<Vec<JobDetail>, StoreError> {
        let conn = self.store.conn()?;
        let mut stmt =
            conn.prepare("SELECT job_id, task_groups, constraints, status FROM jobs")?;
        let raw: Vec<RawJob> = stmt
            .query_map([], Self::job_row)?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        drop(conn);

        raw.into_iter()
            .map(|r| Self::job_from_raw(r).and_then(|job| self.job_detail(job)))
            .collect()
    }

    pub fn get_job_allocations(&self, job_id: &str) -> Result<Vec<AllocationRow>, StoreError> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT allocation_id, job_id, node_id, task_group, status, start_time, end_time
             FROM allocations WHERE job_id = ?1",
        )?;
        let raw: Vec<RawAllocation> = stmt
            .query_map(params![job_id], Self::allocation_row)?
            .collect::<Result<_, _>>()?;
        raw.into_iter().map(Self::allocation_from_raw).collect()
    }

    /// Force a job's status, bypassing derivation. Used by the explicit
    /// lifecycle operations (stop, restart), not by reconciliation.
    pub fn set_job_status(&self, job_id: &str, status: JobStatus) -> Result<bool, StoreError> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?1 WHERE job_id = ?2",
            params![status.as_str(), job_id],
        )?;
        Ok(changed > 0)
    }

    /// Mark a job `dead` and return its current allocations so the caller
    /// can stop them on the agents.
    pub fn mark_job_dead(&self, job_id: &str) -> Result<Vec<AllocationRow>, StoreError> {
        let allocations = self.get_job_allocations(job_id)?;
        self.set_job_status(job_id, JobStatus::Dead)?;
        info!(%job_id, allocations = allocations.len(), "job marked dead");
        Ok(allocations)
    }

    /// Remove every row belonging to a job: task statuses, allocations,
    /// then the job itself. Does not talk to agents.
    pub fn clean_job_data(&self, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM task_status WHERE allocation_id IN
             (SELECT allocation_id FROM allocations WHERE job_id = ?1)",
            params![job_id],
        )?;
        tx.execute("DELETE FROM allocations WHERE job_id = ?1", params![job_id])?;
        tx.execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])?;
        tx.commit()?;
        info!(%job_id, "job data cleaned");
        Ok(())
    }

    // =========================================================================
    // Allocations
    // =========================================================================

    /// Upsert an allocation row, then recompute the owning job's status.
    pub fn update_allocation(&self, alloc: &Allocation) -> Result<(), StoreError> {
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO allocations
             (allocation_id, job_id, node_id, task_group, status, start_time, end_time, last_update)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                alloc.allocation_id,
                alloc.job_id,
                alloc.node_id,
                alloc.task_group.name,
                alloc.status.as_str(),
                alloc.start_time,
                alloc.end_time,
                now_ts(),
            ],
        )?;
        drop(conn);
        self.recompute_job_status(&alloc.job_id)?;
        Ok(())
    }

    /// Remove an allocation and its task-status rows. Returns the node to
    /// notify when `notify_agent` is set and the row existed. Deleting a
    /// missing allocation is a no-op success.
    pub fn delete_allocation(
        &self,
        allocation_id: &str,
        notify_agent: bool,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;
        let node_id: Option<String> = tx
            .query_row(
                "SELECT node_id FROM allocations WHERE allocation_id = ?1",
                params![allocation_id],
                |row| row.get(0),
            )
            .optional()?;
        tx.execute(
            "DELETE FROM task_status WHERE allocation_id = ?1",
            params![allocation_id],
        )?;
        tx.execute(
            "DELETE FROM allocations WHERE allocation_id = ?1",
            params![allocation_id],
        )?;
        tx.commit()?;
        debug!(%allocation_id, "allocation deleted");
        Ok(if notify_agent { node_id } else { None })
    }

    // =========================================================================
    // Job status derivation
    // =========================================================================

    /// Recompute a job's status from its allocations via
    /// [`derive_job_status`]. Every allocation mutation funnels through
    /// here; nothing else derives job status.
    pub fn recompute_job_status(&self, job_id: &str) -> Result<Option<JobStatus>, StoreError> {
        let allocations = self.get_job_allocations(job_id)?;
        if allocations.is_empty() {
            return Ok(None);
        }
        let counts = StatusCounts::from_rows(&allocations);
        let derived = derive_job_status(&counts, || {
            self.job_has_sufficient_resources(job_id).unwrap_or(false)
        });
        if let Some(status) = derived {
            self.set_job_status(job_id, status)?;
            debug!(%job_id, status = status.as_str(), "job status recomputed");
        }
        Ok(derived)
    }

    /// Whether every task group of the job could be placed on some healthy
    /// node, after subtracting the demands of allocations already running
    /// there. Used only for the pending-vs-blocked distinction.
    pub fn job_has_sufficient_resources(&self, job_id: &str) -> Result<bool, StoreError> {
        let Some(job) = self.get_job(job_id)? else {
            return Ok(false);
        };
        let nodes = self.list_healthy_nodes()?;
        if nodes.is_empty() {
            return Ok(false);
        }

        // Demand already running per node, resolved from each running
        // allocation's task-group definition in its owning job.
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT node_id, job_id, task_group FROM allocations WHERE status = 'running'",
        )?;
        let running: Vec<(String, String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        drop(conn);

        let mut job_cache: HashMap<String, Option<Job>> = HashMap::new();
        let mut used: HashMap<String, (i64, i64)> = HashMap::new();
        for (node_id, owner_id, group_name) in running {
            let owner = match job_cache.get(&owner_id) {
                Some(cached) => cached.clone(),
                None => {
                    let fetched = self.get_job(&owner_id)?;
                    job_cache.insert(owner_id.clone(), fetched.clone());
                    fetched
                }
            };
            let Some(owner) = owner else { continue };
            if let Some(group) = owner.task_groups.iter().find(|g| g.name == group_name) {
                let demand = group.total_resources();
                let entry = used.entry(node_id).or_insert((0, 0));
                entry.0 += demand.cpu;
                entry.1 += demand.memory;
            }
        }

        for group in &job.task_groups {
            let need = group.total_resources();
            let satisfied = nodes.iter().any(|node| {
                let (used_cpu, used_mem) = used.get(&node.node_id).copied().unwrap_or((0, 0));
                node.healthy
                    && node.resources.cpu - used_cpu >= need.cpu
                    && node.resources.memory - used_mem >= need.memory
            });
            if !satisfied {
                debug!(%job_id, group = %group.name, "insufficient resources for task group");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Classify a job with no allocations as `blocked` or `pending` after
    /// a failed evaluation. Jobs in other states are left untouched.
    pub fn flag_capacity_block(&self, job_id: &str) -> Result<(), StoreError> {
        let Some(job) = self.get_job(job_id)? else {
            return Ok(());
        };
        if !matches!(job.status, JobStatus::Pending | JobStatus::Blocked) {
            return Ok(());
        }
        let status = if self.job_has_sufficient_resources(job_id)? {
            JobStatus::Pending
        } else {
            JobStatus::Blocked
        };
        self.set_job_status(job_id, status)?;
        Ok(())
    }

    // =========================================================================
    // Health sweep
    // =========================================================================

    /// One sweep: mark nodes whose heartbeat is older than `timeout_secs`
    /// unhealthy, cascade their non-terminal allocations (and task rows) to
    /// `lost`, all in one transaction. The caller recomputes the affected
    /// jobs afterwards.
    pub fn sweep_expired(&self, timeout_secs: f64) -> Result<SweepOutcome, StoreError> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;
        let now = now_ts();
        let threshold = now - timeout_secs;

        let nodes_marked = tx.execute(
            "UPDATE nodes SET healthy = 0 WHERE last_heartbeat < ?1 AND healthy = 1",
            params![threshold],
        )?;

        let mut outcome = SweepOutcome {
            nodes_marked,
            ..SweepOutcome::default()
        };

        if nodes_marked > 0 {
            let lost: Vec<(String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT a.allocation_id, a.job_id
                     FROM allocations a JOIN nodes n ON a.node_id = n.node_id
                     WHERE n.healthy = 0
                       AND a.status NOT IN ('complete', 'failed', 'lost', 'stopped')",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<_, _>>()?;
                rows
            };

            for (allocation_id, job_id) in lost {
                tx.execute(
                    "UPDATE allocations SET status = 'lost', end_time = ?1, last_update = ?1
                     WHERE allocation_id = ?2",
                    params![now, allocation_id],
                )?;
                tx.execute(
                    "UPDATE task_status SET status = 'lost', end_time = ?1
                     WHERE allocation_id = ?2 AND status NOT IN ('complete', 'failed', 'lost')",
                    params![now, allocation_id],
                )?;
                outcome.allocations_lost += 1;
                if !outcome.affected_jobs.contains(&job_id) {
                    outcome.affected_jobs.push(job_id);
                }
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    // =========================================================================
    // Job templates
    // =========================================================================

    pub fn create_template(&self, spec: &TemplateSpec) -> Result<JobTemplate, StoreError> {
        let conn = self.store.conn()?;
        let now = now_ts();
        let template = JobTemplate {
            template_id: Uuid::new_v4().to_string(),
            name: spec.name.clone(),
            description: spec.description.clone(),
            task_groups: spec.task_groups.clone(),
            constraints: spec.constraints.clone(),
            created_at: now,
            updated_at: now,
        };
        conn.execute(
            "INSERT INTO job_templates
             (template_id, name, description, task_groups, constraints, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                template.template_id,
                template.name,
                template.description,
                serde_json::to_string(&template.task_groups)?,
                serde_json::to_string(&template.constraints)?,
                template.created_at,
                template.updated_at,
            ],
        )?;
        Ok(template)
    }

    pub fn get_template(&self, template_id: &str) -> Result<Option<JobTemplate>, StoreError> {
        let conn = self.store.conn()?;
        let raw: Option<RawTemplate> = conn
            .query_row(
                "SELECT template_id, name, description, task_groups, constraints, created_at, updated_at
                 FROM job_templates WHERE template_id = ?1",
                params![template_id],
                Self::template_row,
            )
            .optional()?;
        raw.map(Self::template_from_raw).transpose()
    }

    pub fn list_templates(&self) -> Result<Vec<JobTemplate>, StoreError> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT template_id, name, description, task_groups, constraints, created_at, updated_at
             FROM job_templates ORDER BY created_at DESC",
        )?;
        let raw: Vec<RawTemplate> = stmt
            .query_map([], Self::template_row)?
            .collect::<Result<_, _>>()?;
        raw.into_iter().map(Self::template_from_raw).collect()
    }

    pub fn update_template(
        &self,
        template_id: &str,
        spec: &TemplateSpec,
    ) -> Result<bool, StoreError> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE job_templates
             SET name = ?1, description = ?2, task_groups = ?3, constraints = ?4, updated_at = ?5
             WHERE template_id = ?6",
            params![
                spec.name,
                spec.description,
                serde_json::to_string(&spec.task_groups)?,
                serde_json::to_string(&spec.constraints)?,
                now_ts(),
                template_id,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_template(&self, template_id: &str) -> Result<bool, StoreError> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "DELETE FROM job_templates WHERE template_id = ?1",
            params![template_id],
        )?;
        Ok(changed > 0)
    }

    /// Test-only reset of all operational tables.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.store.clear_all()
    }

    #[cfg(test)]
    pub(crate) fn store_conn_for_tests(&self) -> rusqlite::Connection {
        self.store.conn().expect("test connection")
    }

    // =========================================================================
    // Row plumbing
    // =========================================================================

    fn job_detail(&self, job: Job) -> Result<JobDetail, StoreError> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT allocation_id, job_id, node_id, task_group, status, start_time, end_time
             FROM allocations WHERE job_id = ?1",
        )?;
        let raw: Vec<RawAllocation> = stmt
            .query_map(params![job.job_id], Self::allocation_row)?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let mut allocations = Vec::with_capacity(raw.len());
        for raw_alloc in raw {
            let row = Self::allocation_from_raw(raw_alloc)?;
            let mut tasks = HashMap::new();
            let mut task_stmt = conn.prepare(
                "SELECT task_name, resources, config, status, start_time, end_time, exit_code, message
                 FROM task_status WHERE allocation_id = ?1",
            )?;
            let task_rows: Vec<RawTaskStatus> = task_stmt
                .query_map(params![row.allocation_id], |r| {
                    Ok(RawTaskStatus {
                        task_name: r.get(0)?,
                        resources: r.get(1)?,
                        config: r.get(2)?,
                        status: r.get(3)?,
                        start_time: r.get(4)?,
                        end_time: r.get(5)?,
                        exit_code: r.get(6)?,
                        message: r.get(7)?,
                    })
                })?
                .collect::<Result<_, _>>()?;
            for task in task_rows {
                let status = TaskState::parse(&task.status).ok_or_else(|| {
                    StoreError::Corrupt(format!("unknown task status '{}'", task.status))
                })?;
                tasks.insert(
                    task.task_name,
                    TaskDetail {
                        resources: task
                            .resources
                            .as_deref()
                            .map(serde_json::from_str)
                            .transpose()?,
                        config: task
                            .config
                            .as_deref()
                            .map(serde_json::from_str)
                            .transpose()?,
                        status,
                        start_time: task.start_time,
                        end_time: task.end_time,
                        exit_code: task.exit_code,
                        message: task.message,
                    },
                );
            }
            allocations.push(AllocationDetail {
                allocation_id: row.allocation_id,
                node_id: row.node_id,
                task_group: row.task_group,
                status: row.status,
                start_time: row.start_time,
                end_time: row.end_time,
                tasks,
            });
        }

        Ok(JobDetail {
            job_id: job.job_id,
            task_groups: job.task_groups,
            constraints: job.constraints,
            status: job.status,
            allocations,
        })
    }

    fn node_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawNode> {
        Ok(RawNode {
            node_id: row.get(0)?,
            ip_address: row.get(1)?,
            resources: row.get(2)?,
            healthy: row.get(3)?,
            last_heartbeat: row.get(4)?,
            endpoint: row.get(5)?,
        })
    }

    fn node_from_raw(raw: RawNode) -> Result<Node, StoreError> {
        Ok(Node {
            node_id: raw.node_id,
            ip_address: raw.ip_address,
            resources: serde_json::from_str(&raw.resources)?,
            healthy: raw.healthy != 0,
            last_heartbeat: raw.last_heartbeat,
            endpoint: raw.endpoint.unwrap_or_default(),
        })
    }

    fn job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawJob> {
        Ok(RawJob {
            job_id: row.get(0)?,
            task_groups: row.get(1)?,
            constraints: row.get(2)?,
            status: row.get(3)?,
        })
    }

    fn job_from_raw(raw: RawJob) -> Result<Job, StoreError> {
        let status = JobStatus::parse(&raw.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job status '{}'", raw.status)))?;
        Ok(Job {
            job_id: raw.job_id,
            task_groups: serde_json::from_str(&raw.task_groups)?,
            constraints: serde_json::from_str(&raw.constraints)?,
            status,
        })
    }

    fn allocation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAllocation> {
        Ok(RawAllocation {
            allocation_id: row.get(0)?,
            job_id: row.get(1)?,
            node_id: row.get(2)?,
            task_group: row.get(3)?,
            status: row.get(4)?,
            start_time: row.get(5)?,
            end_time: row.get(6)?,
        })
    }

    fn allocation_from_raw(raw: RawAllocation) -> Result<AllocationRow, StoreError> {
        let status = AllocationStatus::parse(&raw.status).ok_or_else(|| {
            StoreError::Corrupt(format!("unknown allocation status '{}'", raw.status))
        })?;
        Ok(AllocationRow {
            allocation_id: raw.allocation_id,
            job_id: raw.job_id,
            node_id: raw.node_id,
            task_group: raw.task_group,
            status,
            start_time: raw.start_time,
            end_time: raw.end_time,
        })
    }

    fn template_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTemplate> {
        Ok(RawTemplate {
            template_id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            task_groups: row.get(3)?,
            constraints: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn template_from_raw(raw: RawTemplate) -> Result<JobTemplate, StoreError> {
        Ok(JobTemplate {
            template_id: raw.template_id,
            name: raw.name,
            description: raw.description,
            task_groups: serde_json::from_str(&raw.task_groups)?,
            constraints: raw
                .constraints
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?
                .unwrap_or_default(),
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }
}

struct RawNode {
    node_id: String,
    ip_address: String,
    resources: String,
    healthy: i64,
    last_heartbeat: f64,
    endpoint: Option<String>,
}

struct RawJob {
    job_id: String,
    task_groups: String,
    constraints: String,
    status: String,
}

struct RawAllocation {
    allocation_id: String,
    job_id: String,
    node_id: String,
    task_group: String,
    status: String,
    start_time: Option<f64>,
    end_time: Option<f64>,
}

struct RawTaskStatus {
    task_name: String,
    resources: Option<String>,
    config: Option<String>,
    status: String,
    start_time: Option<f64>,
    end_time: Option<f64>,
    exit_code: Option<i64>,
    message: Option<String>,
}

struct RawTemplate {
    template_id: String,
    name: String,
    description: Option<String>,
    task_groups: String,
    constraints: Option<String>,
    created_at: f64,
    updated_at: f64,
}
