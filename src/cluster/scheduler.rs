//! Evaluation queue and scheduling worker
//!
//! The scheduler owns a single queue of evaluations and one worker that
//! drains it: run the planner, forward successful plans to the executor
//! over a typed channel, record the evaluation outcome. Failures are
//! contained per evaluation; the worker never exits on a failed unit.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::store::StoreError;

use super::models::{
    Evaluation, EvaluationStatus, Job, JobSpec, JobStatus, Plan, TriggerEvent,
};
use super::node_manager::NodeManager;
use super::planner;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("scheduler worker is not running")]
    WorkerGone,
}

/// Handle for creating and tracking evaluations. The worker lives in a
/// background task spawned by [`spawn_scheduler`].
#[derive(Clone)]
pub struct Scheduler {
    node_manager: Arc<NodeManager>,
    eval_tx: mpsc::UnboundedSender<Evaluation>,
    evaluations: Arc<DashMap<String, EvaluationStatus>>,
}

impl Scheduler {
    /// Persist the job baseline (status preserved for existing jobs),
    /// capture the healthy-node snapshot, and enqueue an evaluation.
    /// Returns `(job_id, evaluation_id)`.
    pub fn create_evaluation(
        &self,
        mut spec: JobSpec,
        job_id: Option<String>,
    ) -> Result<(String, String), SchedulerError> {
        if let Some(id) = job_id {
            spec.job_id = Some(id);
        }
        let existing = match &spec.job_id {
            Some(id) => self.node_manager.get_job(id)?,
            None => None,
        };

        let (job_id, is_update) = self.node_manager.submit_job(&spec)?;
        let snapshot = self.node_manager.list_healthy_nodes()?;

        let trigger = if is_update {
            TriggerEvent::JobUpdate
        } else {
            TriggerEvent::JobSubmit
        };
        let status = existing
            .as_ref()
            .map(|j| j.status)
            .unwrap_or(JobStatus::Pending);
        let job = Job::from_spec(&job_id, &spec, status);

        let evaluation = Evaluation::new(trigger, job, snapshot, existing);
        let evaluation_id = evaluation.id.clone();
        info!(%job_id, %evaluation_id, ?trigger, "evaluation created");

        self.evaluations
            .insert(evaluation_id.clone(), EvaluationStatus::Pending);
        self.eval_tx
            .send(evaluation)
            .map_err(|_| SchedulerError::WorkerGone)?;
        Ok((job_id, evaluation_id))
    }

    pub fn evaluation_status(&self, evaluation_id: &str) -> Option<EvaluationStatus> {
        self.evaluations.get(evaluation_id).map(|s| *s)
    }
}

/// Start the scheduling worker. Successful plans flow out through
/// `plan_tx`; the returned sender stops the worker.
pub fn spawn_scheduler(
    node_manager: Arc<NodeManager>,
    plan_tx: mpsc::UnboundedSender<Plan>,
) -> (Scheduler, watch::Sender<bool>) {
    let (eval_tx, mut eval_rx) = mpsc::unbounded_channel::<Evaluation>();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let evaluations: Arc<DashMap<String, EvaluationStatus>> = Arc::new(DashMap::new());

    let scheduler = Scheduler {
        node_manager: node_manager.clone(),
        eval_tx,
        evaluations: evaluations.clone(),
    };

    tokio::spawn(async move {
        info!("scheduler worker started");
        loop {
            tokio::select! {
                maybe_eval = eval_rx.recv() => {
                    let Some(evaluation) = maybe_eval else { break };
                    let evaluation_id = evaluation.id.clone();
                    let status = process_evaluation(&node_manager, &plan_tx, evaluation);
                    evaluations.insert(evaluation_id, status);
                }
                changed = shutdown_rx.changed() => {
                    // A dropped shutdown handle also stops the worker.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("scheduler worker shutting down");
                        break;
                    }
                }
            }
        }
    });

    (scheduler, shutdown_tx)
}

fn process_evaluation(
    node_manager: &NodeManager,
    plan_tx: &mpsc::UnboundedSender<Plan>,
    evaluation: Evaluation,
) -> EvaluationStatus {
    let evaluation_id = evaluation.id.clone();
    let job_id = evaluation.job.job_id.clone();

    let existing = match node_manager.get_job_allocations(&job_id) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(%evaluation_id, %job_id, error = %e, "could not load existing allocations");
            return EvaluationStatus::Failed;
        }
    };

    let outcome = planner::plan(&evaluation, &existing);
    if outcome.success {
        info!(
            %evaluation_id,
            %job_id,
            creates = outcome.plan.creates.len(),
            deletes = outcome.plan.deletes.len(),
            "evaluation complete"
        );
        if plan_tx.send(outcome.plan).is_err() {
            warn!(%evaluation_id, "executor queue closed, plan dropped");
            return EvaluationStatus::Failed;
        }
        EvaluationStatus::Complete
    } else {
        warn!(%evaluation_id, %job_id, "evaluation failed: not every task group could be placed");
        // With no allocations there is nothing for derivation to work on;
        // classify the job as blocked or pending from the capacity test.
        match node_manager.recompute_job_status(&job_id) {
            Ok(None) => {
                if let Err(e) = node_manager.flag_capacity_block(&job_id) {
                    warn!(%job_id, error = %e, "could not classify blocked job");
                }
            }
            Ok(Some(_)) => {}
            Err(e) => warn!(%job_id, error = %e, "job status recomputation failed"),
        }
        EvaluationStatus::Failed
    }
}
