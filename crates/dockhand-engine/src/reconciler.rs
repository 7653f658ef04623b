// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation loop.
//!
//! A single background task that brings stored job state in line with the
//! backends at a fixed interval. Ticks never overlap: the next sleep starts
//! only after the previous tick returned.
//!
//! Per tick:
//! - preconditions: the engine is ready and each backend answers a ping;
//!   otherwise the backend (or the whole tick) is skipped and the condition
//!   is logged once until it clears
//! - plain engine: read the event stream since the stored watermark and
//!   dispatch every event, then advance the watermark
//! - swarm/cluster: walk the jobs of the backend that are not finalized yet
//!   and route each one (see [`Route`])
//! - log backend jobs the store does not know about, once per native id
//!
//! Per-job failures are isolated and end up as failed entries in the
//! [`TickReport`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::backend::{
    AdapterRegistry, BackendAdapter, BackendError, BackendEvent, BackendKind, with_timeout,
};
use crate::collaborators::{Workflow, WorkflowService};
use crate::dispatcher::{DispatchOutcome, EventDispatcher, JobEvent};
use crate::error::{Error, Result};
use crate::job::{FinalizationState, Job};
use crate::persistence::JobStore;
use crate::status::JobStatus;

/// Configuration for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between the end of one tick and the start of the next.
    pub interval: Duration,
    /// Timeout applied to every backend call.
    pub backend_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            backend_timeout: Duration::from_secs(30),
        }
    }
}

/// "Already logged" state for conditions that persist across ticks.
///
/// Every method is a transition and returns whether the caller should log it.
#[derive(Debug, Default)]
pub struct LogSuppression {
    not_ready: bool,
    unreachable: HashSet<BackendKind>,
    stream_failed: HashSet<BackendKind>,
    untracked: HashSet<(BackendKind, String)>,
}

impl LogSuppression {
    /// The engine is not ready yet.
    pub fn engine_not_ready(&mut self) -> bool {
        !std::mem::replace(&mut self.not_ready, true)
    }

    /// The engine became ready.
    pub fn engine_ready(&mut self) -> bool {
        std::mem::replace(&mut self.not_ready, false)
    }

    /// A backend did not answer its ping.
    pub fn backend_down(&mut self, kind: BackendKind) -> bool {
        self.unreachable.insert(kind)
    }

    /// A backend answered its ping.
    pub fn backend_up(&mut self, kind: BackendKind) -> bool {
        self.unreachable.remove(&kind)
    }

    /// A backend event stream could not be read.
    pub fn stream_failed(&mut self, kind: BackendKind) -> bool {
        self.stream_failed.insert(kind)
    }

    /// A backend job was seen that the store does not know.
    pub fn untracked_seen(&mut self, kind: BackendKind, native_id: &str) -> bool {
        self.untracked.insert((kind, native_id.to_string()))
    }

    /// Forget untracked jobs of a backend that are no longer listed.
    pub fn retain_untracked(&mut self, kind: BackendKind, active: &HashSet<String>) {
        self.untracked
            .retain(|(k, id)| *k != kind || active.contains(id));
    }

    /// A tick succeeded for every job and backend.
    pub fn tick_succeeded(&mut self) {
        self.stream_failed.clear();
    }
}

/// One unit of work in a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportEntry {
    /// Backend the work was for.
    pub backend: BackendKind,
    /// Job, if the work was for a single job.
    pub job_id: Option<i64>,
    /// Failure reason, `None` on success.
    pub error: Option<String>,
}

/// How a tick went overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing failed (also for an empty tick).
    AllSucceeded,
    /// Nothing succeeded.
    AllFailed,
    /// Some entries failed.
    Mixed,
}

/// Aggregate result of one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// The tick was skipped because the engine was not ready.
    pub skipped: bool,
    /// Per-job and per-backend entries.
    pub entries: Vec<ReportEntry>,
}

impl TickReport {
    fn succeeded(&mut self, backend: BackendKind, job_id: Option<i64>) {
        self.entries.push(ReportEntry {
            backend,
            job_id,
            error: None,
        });
    }

    fn failed(&mut self, backend: BackendKind, job_id: Option<i64>, error: impl ToString) {
        self.entries.push(ReportEntry {
            backend,
            job_id,
            error: Some(error.to_string()),
        });
    }

    /// Classify the tick.
    pub fn outcome(&self) -> TickOutcome {
        let failed = self.failures().count();
        if failed == 0 {
            TickOutcome::AllSucceeded
        } else if failed == self.entries.len() {
            TickOutcome::AllFailed
        } else {
            TickOutcome::Mixed
        }
    }

    /// Failed entries.
    pub fn failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.error.is_some())
    }
}

/// What a tick does with one swarm/cluster job.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Finalizing or finalized; nothing to do.
    Skip,
    /// Terminal but never finalized; wait for the backend to confirm the exit.
    Confirm,
    /// The workflow already reached a terminal status the job did not.
    AlignWithWorkflow(JobStatus),
    /// Waiting for service-level confirmation.
    Waiting,
    /// Running; ask the backend.
    Active,
}

/// Decide how to reconcile a freshly read job.
pub fn route(job: &Job, workflow: Option<&Workflow>) -> Route {
    if job.finalization != FinalizationState::Pending || job.status == JobStatus::Finalizing {
        return Route::Skip;
    }
    if job.is_terminal() {
        return Route::Confirm;
    }
    if let Some(workflow) = workflow
        && workflow.status.is_terminal()
    {
        return Route::AlignWithWorkflow(workflow.status.clone());
    }
    if job.status.is_waiting() {
        Route::Waiting
    } else {
        Route::Active
    }
}

/// The reconciliation loop.
pub struct Reconciler {
    store: Arc<dyn JobStore>,
    adapters: AdapterRegistry,
    dispatcher: EventDispatcher,
    workflows: Arc<dyn WorkflowService>,
    config: ReconcilerConfig,
    suppression: Mutex<LogSuppression>,
    ready: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Create a reconciler. It starts out ready.
    pub fn new(
        store: Arc<dyn JobStore>,
        adapters: AdapterRegistry,
        dispatcher: EventDispatcher,
        workflows: Arc<dyn WorkflowService>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            adapters,
            dispatcher,
            workflows,
            config,
            suppression: Mutex::new(LogSuppression::default()),
            ready: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Get the readiness flag. Ticks are skipped while it is false.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// Set the readiness flag.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Run the loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            backends = self.adapters.len(),
            "Reconciler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    self.tick().await;
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// Run one reconciliation pass.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        if !self.ready.load(Ordering::Acquire) {
            if self.suppression.lock().await.engine_not_ready() {
                warn!("Engine not ready, skipping reconciliation");
            }
            report.skipped = true;
            return report;
        }
        if self.suppression.lock().await.engine_ready() {
            info!("Engine ready, reconciliation resumed");
        }

        for adapter in self.adapters.iter() {
            let kind = adapter.kind();
            if let Err(e) = with_timeout(self.config.backend_timeout, adapter.ping()).await {
                if self.suppression.lock().await.backend_down(kind) {
                    warn!(backend = %kind, error = %e, "Backend unreachable, skipping");
                }
                report.failed(kind, None, e);
                continue;
            }
            if self.suppression.lock().await.backend_up(kind) {
                info!(backend = %kind, "Backend reachable again");
            }

            if kind.is_service_based() {
                self.reconcile_jobs(adapter.as_ref(), &mut report).await;
            } else {
                self.poll_events(adapter.as_ref(), &mut report).await;
            }
            self.detect_untracked(adapter.as_ref()).await;
        }

        match report.outcome() {
            TickOutcome::AllSucceeded => {
                self.suppression.lock().await.tick_succeeded();
                debug!(entries = report.entries.len(), "Reconciliation tick succeeded");
            }
            outcome => {
                for entry in report.failures() {
                    warn!(
                        backend = %entry.backend,
                        job_id = ?entry.job_id,
                        error = entry.error.as_deref().unwrap_or_default(),
                        "Reconciliation entry failed"
                    );
                }
                warn!(
                    outcome = ?outcome,
                    failed = report.failures().count(),
                    total = report.entries.len(),
                    "Reconciliation tick had failures"
                );
            }
        }

        report
    }

    /// Read the event stream of a plain engine.
    async fn poll_events(&self, adapter: &dyn BackendAdapter, report: &mut TickReport) {
        let kind = adapter.kind();
        let now = Utc::now();
        let since = match self.store.last_event_check(kind).await {
            Ok(Some(at)) => at,
            Ok(None) => {
                now - chrono::Duration::from_std(self.config.interval)
                    .unwrap_or_else(|_| chrono::Duration::zero())
            }
            Err(e) => {
                report.failed(kind, None, e);
                return;
            }
        };

        let events = match with_timeout(
            self.config.backend_timeout,
            adapter.events_since(since, now),
        )
        .await
        {
            Ok(events) => events,
            Err(BackendError::Unsupported(_)) => {
                debug!(backend = %kind, "Backend has no event stream");
                return;
            }
            Err(e) => {
                if self.suppression.lock().await.stream_failed(kind) {
                    warn!(backend = %kind, error = %e, "Failed to read backend events");
                }
                report.failed(kind, None, e);
                return;
            }
        };

        debug!(backend = %kind, count = events.len(), since = %since, "Dispatching backend events");
        for event in events {
            match self.dispatcher.dispatch(JobEvent::Container(event)).await {
                DispatchOutcome::Failed(reason) => report.failed(kind, None, reason),
                _ => report.succeeded(kind, None),
            }
        }

        if let Err(e) = self.store.set_last_event_check(kind, now).await {
            error!(backend = %kind, error = %e, "Failed to store event watermark");
            report.failed(kind, None, e);
        }
    }

    /// Walk the unfinalized jobs of a service-based backend.
    async fn reconcile_jobs(&self, adapter: &dyn BackendAdapter, report: &mut TickReport) {
        let kind = adapter.kind();
        let jobs = match self.store.list_unfinalized(Some(kind)).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(backend = %kind, error = %e, "Failed to list unfinalized jobs");
                report.failed(kind, None, e);
                return;
            }
        };

        for job in jobs {
            match self.reconcile_job(adapter, job.id).await {
                Ok(()) => report.succeeded(kind, Some(job.id)),
                Err(e) => {
                    error!(
                        job_id = job.id,
                        service_id = job.service_id.as_deref().unwrap_or("-"),
                        task_id = job.task_id.as_deref().unwrap_or("-"),
                        error = %e,
                        "Failed to reconcile job"
                    );
                    report.failed(kind, Some(job.id), e);
                }
            }
        }
    }

    async fn reconcile_job(&self, adapter: &dyn BackendAdapter, job_id: i64) -> Result<()> {
        // The listing may be stale by now.
        let Some(job) = self.store.get(job_id).await? else {
            return Ok(());
        };
        let workflow = match job.workflow_id.as_deref() {
            Some(id) => self.workflows.get(id).await?,
            None => None,
        };

        match route(&job, workflow.as_ref()) {
            Route::Skip => Ok(()),
            Route::AlignWithWorkflow(status) => self.align_with_workflow(job, status).await,
            Route::Waiting | Route::Confirm => self.dispatch(JobEvent::Waiting { job_id }).await,
            Route::Active => self.check_active(adapter, &job).await,
        }
    }

    async fn align_with_workflow(&self, mut job: Job, status: JobStatus) -> Result<()> {
        info!(
            job_id = job.id,
            workflow_id = job.workflow_id.as_deref().unwrap_or("-"),
            from = %job.status,
            to = %status,
            "Job lags behind its workflow, aligning status"
        );
        let message = format!("Aligned with workflow status {}", status);
        if !job.set_final_status(status, message) {
            debug!(job_id = job.id, "Workflow alignment already recorded");
            return Ok(());
        }
        // The workflow already ended; there is nothing left to finalize.
        job.finalization = FinalizationState::Finalized;
        self.store.save(&job).await?;
        Ok(())
    }

    async fn check_active(&self, adapter: &dyn BackendAdapter, job: &Job) -> Result<()> {
        let job_ref = job
            .job_ref()
            .ok_or_else(|| Error::InvalidState(format!("{} has no native id", job.describe())))?;

        let event = match with_timeout(self.config.backend_timeout, adapter.describe(&job_ref))
            .await
        {
            Ok(event) => event,
            Err(BackendError::NotFound(reason)) => {
                let last_status = job
                    .history
                    .latest()
                    .map(|e| e.status.clone())
                    .unwrap_or_else(|| job.status.clone());
                warn!(
                    job_id = job.id,
                    native_id = %job_ref.native_id,
                    last_status = %last_status,
                    reason = %reason,
                    "Active job vanished from backend, assuming node loss"
                );
                BackendEvent::synthetic(
                    job_ref,
                    JobStatus::Failed(Some(node_error(job.backend).to_string())),
                    format!("Backend lost the job while {}", last_status),
                )
                .with_exit_code(job.last_exit_code())
                .exit(true)
            }
            Err(BackendError::LookupFailed { reason, .. }) => {
                warn!(
                    job_id = job.id,
                    native_id = %job_ref.native_id,
                    reason = %reason,
                    "Task lookup failed, marking task lost"
                );
                BackendEvent::synthetic(
                    job_ref,
                    JobStatus::Failed(Some("Lost task".to_string())),
                    format!("Task lookup failed: {}", reason),
                )
                .exit(true)
            }
            Err(e) => return Err(e.into()),
        };

        self.dispatch(JobEvent::Task {
            job_id: job.id,
            event,
        })
        .await
    }

    async fn dispatch(&self, event: JobEvent) -> Result<()> {
        match self.dispatcher.dispatch(event).await {
            DispatchOutcome::Failed(reason) => Err(Error::Dispatch(reason)),
            _ => Ok(()),
        }
    }

    /// Log backend jobs the store does not know, once per native id.
    async fn detect_untracked(&self, adapter: &dyn BackendAdapter) {
        let kind = adapter.kind();
        let active = match with_timeout(self.config.backend_timeout, adapter.list_active_jobs())
            .await
        {
            Ok(active) => active,
            Err(e) => {
                debug!(backend = %kind, error = %e, "Could not list active backend jobs");
                return;
            }
        };

        let mut untracked = Vec::new();
        for job_ref in &active {
            match self.store.get_by_native_id(kind, &job_ref.native_id).await {
                Ok(Some(_)) => {}
                Ok(None) => untracked.push(job_ref.native_id.clone()),
                Err(e) => {
                    debug!(backend = %kind, error = %e, "Could not check backend job");
                    return;
                }
            }
        }

        let listed: HashSet<String> = active.into_iter().map(|r| r.native_id).collect();
        let mut suppression = self.suppression.lock().await;
        suppression.retain_untracked(kind, &listed);
        for native_id in untracked {
            if suppression.untracked_seen(kind, &native_id) {
                warn!(backend = %kind, native_id = %native_id, "Backend job is not tracked by the engine");
            }
        }
    }
}

fn node_error(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Swarm => "Swarm node error",
        _ => "Node error",
    }
}
