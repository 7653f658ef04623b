// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Finalization coordinator.
//!
//! Drives a job that has exited through its wrap-up exactly once:
//!
//! 1. claim (in-process single flight + atomic claim in the job store)
//! 2. status `Finalizing`
//! 3. handle declared outputs in dependency order
//! 4. launch wrap-up jobs
//! 5. final status `Complete` or `Failed (<reason>)`
//! 6. update the correlated workflow, notify, advance the orchestration chain
//!
//! A failing step marks the job failed and is not retried. Concurrency is
//! bounded by a semaphore; [`FinalizationCoordinator::submit`] queues on it.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collaborators::{
    BoundInput, EngineEvent, LaunchRequest, Launcher, Notifier, OutputHandler, Workflow,
    WorkflowService,
};
use crate::job::{FinalizationState, Job, OutputValue};
use crate::orchestration::{ChainAdvance, OrchestrationController};
use crate::outputs::order_outputs;
use crate::persistence::JobStore;
use crate::single_flight::SingleFlight;
use crate::status::JobStatus;

/// Configuration for the finalization coordinator.
#[derive(Debug, Clone)]
pub struct FinalizerConfig {
    /// Maximum number of finalizations running at once.
    pub pool_size: usize,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self { pool_size: 4 }
    }
}

/// Result of a finalization request.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// This call finalized the job.
    Finalized {
        /// Final status.
        status: JobStatus,
    },
    /// Someone else holds or held the claim.
    AlreadyClaimed,
    /// The job does not exist.
    NotFound,
    /// The job store failed; the claim may be left held.
    StoreFailed(String),
}

/// Finalizes exited jobs.
#[derive(Clone)]
pub struct FinalizationCoordinator {
    store: Arc<dyn JobStore>,
    launcher: Arc<dyn Launcher>,
    workflows: Arc<dyn WorkflowService>,
    outputs: Arc<dyn OutputHandler>,
    notifier: Arc<dyn Notifier>,
    orchestration: OrchestrationController,
    permits: Arc<Semaphore>,
    in_flight: SingleFlight<i64>,
}

impl FinalizationCoordinator {
    /// Create a coordinator.
    pub fn new(
        store: Arc<dyn JobStore>,
        launcher: Arc<dyn Launcher>,
        workflows: Arc<dyn WorkflowService>,
        outputs: Arc<dyn OutputHandler>,
        notifier: Arc<dyn Notifier>,
        orchestration: OrchestrationController,
        config: FinalizerConfig,
    ) -> Self {
        Self {
            store,
            launcher,
            workflows,
            outputs,
            notifier,
            orchestration,
            permits: Arc::new(Semaphore::new(config.pool_size.max(1))),
            in_flight: SingleFlight::new(),
        }
    }

    /// Finalize in the background, waiting for a free slot.
    pub fn submit(
        &self,
        job_id: i64,
        exit_code: Option<i64>,
        success: bool,
    ) -> JoinHandle<FinalizeOutcome> {
        let this = self.clone();
        tokio::spawn(async move { this.finalize(job_id, exit_code, success).await })
    }

    /// Finalize a job now (after waiting for a free slot).
    pub async fn finalize(
        &self,
        job_id: i64,
        exit_code: Option<i64>,
        success: bool,
    ) -> FinalizeOutcome {
        let Some(_guard) = self.in_flight.try_acquire(job_id) else {
            debug!(job_id, "Finalization already in flight, skipping");
            return FinalizeOutcome::AlreadyClaimed;
        };
        let Ok(_permit) = self.permits.acquire().await else {
            return FinalizeOutcome::StoreFailed("finalization pool closed".to_string());
        };

        match self.run(job_id, exit_code, success).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id, error = %e, "Finalization aborted by store failure");
                FinalizeOutcome::StoreFailed(e.to_string())
            }
        }
    }

    /// Number of free finalization slots.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    async fn run(
        &self,
        job_id: i64,
        exit_code: Option<i64>,
        success: bool,
    ) -> Result<FinalizeOutcome, crate::persistence::StoreError> {
        let Some(mut job) = self.store.get(job_id).await? else {
            warn!(job_id, "Job to finalize not found");
            return Ok(FinalizeOutcome::NotFound);
        };
        if !self.store.try_claim_finalization(job_id).await? {
            debug!(job_id, "Finalization already claimed");
            return Ok(FinalizeOutcome::AlreadyClaimed);
        }

        let exit_status = job.status.clone();
        let exit_code = exit_code.or_else(|| job.last_exit_code());
        info!(
            job_id,
            native_id = job.native_id().unwrap_or("-"),
            status = %exit_status,
            exit_code = ?exit_code,
            success,
            "Finalizing job"
        );

        job.finalization = FinalizationState::Claimed;
        job.set_final_status(JobStatus::Finalizing, "Finalization started");
        self.store.save(&job).await?;

        let mut failure = if success {
            None
        } else {
            Some(failure_reason(&exit_status, exit_code))
        };

        if let Err(reason) = self.handle_outputs(&mut job).await {
            failure.get_or_insert(reason);
        }
        if failure.is_none()
            && let Err(reason) = self.launch_wrapups(&job).await
        {
            failure = Some(reason);
        }

        let status = match &failure {
            None => JobStatus::Complete,
            Some(reason) => JobStatus::Failed(Some(reason.clone())),
        };
        let message = match &failure {
            None => "Finalized".to_string(),
            Some(reason) => format!("Finalization failed: {}", reason),
        };
        job.set_final_status(status.clone(), message);
        job.finalization = FinalizationState::Finalized;
        self.store.save(&job).await?;

        match &failure {
            None => info!(job_id, "Job finalized"),
            Some(reason) => warn!(job_id, reason = %reason, "Job finalized as failed"),
        }

        let workflow = self.update_workflow(&job, &status, failure.clone()).await;

        self.notifier.trigger_event(EngineEvent::Finalized {
            job_id,
            status: status.clone(),
            workflow_id: job.workflow_id.clone(),
        });

        if let Some(workflow) = workflow {
            match self.orchestration.on_workflow_terminal(&workflow, &job).await {
                ChainAdvance::NotInChain => {}
                advance => debug!(job_id, advance = ?advance, "Orchestration advanced"),
            }
        }

        Ok(FinalizeOutcome::Finalized { status })
    }

    /// Resolve declared outputs. Stops at the first failing output.
    async fn handle_outputs(&self, job: &mut Job) -> Result<(), String> {
        let mut resolved: Vec<OutputValue> = Vec::new();
        let mut result = Ok(());

        for spec in order_outputs(&job.outputs) {
            match self.outputs.handle_output(job, spec, &resolved).await {
                Ok(Some(value)) => resolved.push(OutputValue {
                    name: spec.name.clone(),
                    value,
                    external: spec.external,
                }),
                Ok(None) => debug!(job_id = job.id, output = %spec.name, "Output not produced"),
                Err(e) => {
                    result = Err(format!("Output {}: {}", spec.name, e));
                    break;
                }
            }
        }

        job.output_values = resolved;
        result
    }

    async fn launch_wrapups(&self, job: &Job) -> Result<(), String> {
        for step in &job.wrapup_steps {
            let inputs = step
                .inputs
                .iter()
                .filter_map(|input| {
                    job.output_values
                        .iter()
                        .find(|o| o.name == input.name)
                        .map(|o| BoundInput {
                            name: input.name.clone(),
                            value: o.value.clone(),
                        })
                })
                .collect();

            let child = self
                .launcher
                .launch(LaunchRequest::wrap_up(step.clone(), inputs, job))
                .await
                .map_err(|e| format!("Wrap-up {}: {}", step.name, e))?;
            debug!(
                job_id = job.id,
                wrapup_job_id = child.id,
                step = %step.name,
                "Wrap-up launched"
            );
        }
        Ok(())
    }

    async fn update_workflow(
        &self,
        job: &Job,
        status: &JobStatus,
        details: Option<String>,
    ) -> Option<Workflow> {
        let workflow_id = job.workflow_id.as_deref()?;
        if let Err(e) = self
            .workflows
            .update_status(workflow_id, status.clone(), details)
            .await
        {
            error!(job_id = job.id, workflow_id, error = %e, "Failed to update workflow status");
            return None;
        }
        match self.workflows.get(workflow_id).await {
            Ok(workflow) => workflow,
            Err(e) => {
                warn!(job_id = job.id, workflow_id, error = %e, "Failed to reload workflow");
                None
            }
        }
    }
}

/// Failure reason for an unsuccessful exit.
///
/// `Waiting (Failed (Oom))` and `Failed (Oom)` give `Oom`; otherwise the
/// exit code is used.
fn failure_reason(status: &JobStatus, exit_code: Option<i64>) -> String {
    match status {
        JobStatus::Waiting(Some(inner)) => failure_reason(inner, exit_code),
        JobStatus::Failed(Some(reason)) => reason.clone(),
        JobStatus::Killed => "Killed".to_string(),
        _ => match exit_code {
            Some(code) if code != 0 => format!("Exit code {}", code),
            _ => "Unsuccessful exit".to_string(),
        },
    }
}
