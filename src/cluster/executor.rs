//! Plan application and job teardown
//!
//! The executor owns a single plan queue with one worker. Each plan is
//! applied as one unit, deletes first and then creates. Agent
//! notifications are best-effort: an unreachable agent is logged and the
//! store still converges (rows purged on delete, allocations marked
//! `failed` on undelivered creates). There are no retries.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::store::StoreError;

use super::models::{AllocationStatus, Plan};
use super::node_manager::NodeManager;
use super::transport::AgentTransport;

pub struct Executor {
    node_manager: Arc<NodeManager>,
    transport: Arc<AgentTransport>,
}

impl Executor {
    pub fn new(node_manager: Arc<NodeManager>, transport: Arc<AgentTransport>) -> Self {
        Self {
            node_manager,
            transport,
        }
    }

    /// Apply one plan: deletes complete before any create begins.
    pub async fn apply_plan(&self, plan: Plan) {
        info!(
            job_id = %plan.job_id,
            creates = plan.creates.len(),
            deletes = plan.deletes.len(),
            "applying plan"
        );

        for allocation_id in &plan.deletes {
            if let Err(e) = self.remove_allocation(allocation_id).await {
                error!(%allocation_id, error = %e, "failed to remove allocation");
            }
        }

        for mut allocation in plan.creates {
            allocation.status = AllocationStatus::Running;
            if let Err(e) = self.transport.send(&allocation).await {
                warn!(
                    allocation_id = %allocation.allocation_id,
                    node_id = %allocation.node_id,
                    error = %e,
                    "agent did not accept allocation"
                );
                allocation.status = AllocationStatus::Failed;
            }
            if let Err(e) = self.node_manager.update_allocation(&allocation) {
                error!(
                    allocation_id = %allocation.allocation_id,
                    error = %e,
                    "failed to persist allocation"
                );
            }
        }
    }

    /// Remove one allocation: purge the row, then tell the agent to stop
    /// it. The row is removed whether or not the agent can be reached.
    pub async fn remove_allocation(&self, allocation_id: &str) -> Result<(), StoreError> {
        let node_id = self.node_manager.delete_allocation(allocation_id, true)?;
        if let Some(node_id) = node_id {
            if let Err(e) = self.transport.stop(&node_id, allocation_id).await {
                warn!(%allocation_id, %node_id, error = %e, "could not notify agent of stop");
            }
        }
        Ok(())
    }

    /// Stop a job: mark it `dead`, stop each allocation on its agent
    /// (best-effort), and purge the allocation rows. Stopping a job with
    /// no allocations is a no-op.
    pub async fn stop_job(&self, job_id: &str) -> Result<(), StoreError> {
        let allocations = self.node_manager.mark_job_dead(job_id)?;
        if allocations.is_empty() {
            return Ok(());
        }
        info!(%job_id, count = allocations.len(), "stopping job allocations");
        for row in allocations {
            if let Err(e) = self
                .transport
                .stop(&row.node_id, &row.allocation_id)
                .await
            {
                warn!(
                    allocation_id = %row.allocation_id,
                    node_id = %row.node_id,
                    error = %e,
                    "could not notify agent of job stop"
                );
            }
            self.node_manager
                .delete_allocation(&row.allocation_id, false)?;
        }
        Ok(())
    }

    /// Delete a job entirely: stop it, then remove every residual row.
    pub async fn delete_job(&self, job_id: &str) -> Result<(), StoreError> {
        if let Err(e) = self.stop_job(job_id).await {
            warn!(%job_id, error = %e, "stop before delete failed, cleaning anyway");
        }
        self.node_manager.clean_job_data(job_id)
    }
}

/// Start the plan worker. Plans are applied strictly in arrival order; the
/// returned sender stops the worker after the current plan completes.
pub fn spawn_executor(
    executor: Arc<Executor>,
    mut plan_rx: mpsc::UnboundedReceiver<Plan>,
) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        info!("executor worker started");
        loop {
            tokio::select! {
                maybe_plan = plan_rx.recv() => {
                    let Some(plan) = maybe_plan else { break };
                    executor.apply_plan(plan).await;
                }
                changed = shutdown_rx.changed() => {
                    // A dropped shutdown handle also stops the worker.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("executor worker shutting down");
                        break;
                    }
                }
            }
        }
    });

    shutdown_tx
}
