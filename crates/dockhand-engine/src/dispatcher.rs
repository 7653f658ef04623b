// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event dispatcher.
//!
//! Single entry point for status changes, shared by the reconciliation loop
//! and the push listeners. Per job at most one event is processed at a time;
//! an event arriving for a job already in flight is dropped, the next tick or
//! push brings the state again.
//!
//! Errors never reach the caller. They are logged with the job id and native
//! ids and reported as [`DispatchOutcome::Failed`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::backend::{AdapterRegistry, BackendError, BackendEvent, with_timeout};
use crate::collaborators::{EngineEvent, Notifier};
use crate::error::{Error, Result};
use crate::finalizer::FinalizationCoordinator;
use crate::job::{AppendOutcome, EntryOrigin, FinalizationState, HistoryEntry, Job};
use crate::persistence::JobStore;
use crate::single_flight::SingleFlight;
use crate::status::JobStatus;

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Timeout for backend calls made while handling an event.
    pub backend_timeout: Duration,
    /// How long a job may wait for service-level confirmation.
    pub waiting_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            backend_timeout: Duration::from_secs(30),
            waiting_timeout: Duration::from_secs(300),
        }
    }
}

/// An event to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// Container/pod event, keyed by backend-native id.
    Container(BackendEvent),
    /// Task snapshot for a known job.
    Task {
        /// Job id.
        job_id: i64,
        /// Snapshot.
        event: BackendEvent,
    },
    /// Check whether a waiting job, or a terminal one not finalized yet, got
    /// its service-level confirmation.
    Waiting {
        /// Job id.
        job_id: i64,
    },
}

/// What dispatching an event did.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Post-exit noise.
    Ignored,
    /// No job uses the native id.
    UnknownJob,
    /// Another event for the job was in flight.
    Dropped,
    /// Already recorded.
    Duplicate,
    /// Recorded in history, status unchanged.
    Recorded,
    /// Recorded and the status moved.
    Applied,
    /// Finalization was submitted.
    FinalizationSubmitted,
    /// The job is still waiting for confirmation.
    StillWaiting,
    /// The event no longer applies to the job.
    Skipped,
    /// Handling failed; the reason was logged.
    Failed(String),
}

/// Dispatches job events.
#[derive(Clone)]
pub struct EventDispatcher {
    store: Arc<dyn JobStore>,
    adapters: AdapterRegistry,
    finalizer: FinalizationCoordinator,
    notifier: Arc<dyn Notifier>,
    in_flight: SingleFlight<i64>,
    config: DispatcherConfig,
}

impl EventDispatcher {
    /// Create a dispatcher.
    pub fn new(
        store: Arc<dyn JobStore>,
        adapters: AdapterRegistry,
        finalizer: FinalizationCoordinator,
        notifier: Arc<dyn Notifier>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            adapters,
            finalizer,
            notifier,
            in_flight: SingleFlight::new(),
            config,
        }
    }

    /// Whether an event for the job is being processed.
    pub fn is_in_flight(&self, job_id: i64) -> bool {
        self.in_flight.contains(&job_id)
    }

    /// Dispatch one event.
    pub async fn dispatch(&self, event: JobEvent) -> DispatchOutcome {
        let job_id = match &event {
            JobEvent::Container(event) => match self.resolve(event).await {
                Ok(Some(job_id)) => job_id,
                Ok(None) => return DispatchOutcome::UnknownJob,
                Err(outcome) => return outcome,
            },
            JobEvent::Task { job_id, .. } | JobEvent::Waiting { job_id } => *job_id,
        };

        let Some(_guard) = self.in_flight.try_acquire(job_id) else {
            debug!(job_id, "Event for job already in flight, dropping");
            return DispatchOutcome::Dropped;
        };

        let result = match event {
            JobEvent::Container(event) => {
                self.on_event(job_id, event, EntryOrigin::BackendEvent)
                    .await
            }
            JobEvent::Task { event, .. } => {
                self.on_event(job_id, event, EntryOrigin::TaskSnapshot)
                    .await
            }
            JobEvent::Waiting { .. } => self.on_waiting(job_id).await,
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id, error = %e, "Failed to dispatch job event");
                DispatchOutcome::Failed(e.to_string())
            }
        }
    }

    /// Map a container event to the job it belongs to.
    async fn resolve(
        &self,
        event: &BackendEvent,
    ) -> std::result::Result<Option<i64>, DispatchOutcome> {
        let noise = event.ignore
            || self
                .adapters
                .get(event.job.kind)
                .is_some_and(|a| a.is_noise(&event.raw_status));
        if noise {
            debug!(job = %event.job, raw_status = %event.raw_status, "Ignoring post-exit noise");
            return Err(DispatchOutcome::Ignored);
        }

        match self
            .store
            .get_by_native_id(event.job.kind, &event.job.native_id)
            .await
        {
            Ok(Some(job)) => Ok(Some(job.id)),
            Ok(None) => {
                debug!(job = %event.job, "Event for untracked job");
                Ok(None)
            }
            Err(e) => {
                error!(job = %event.job, error = %e, "Failed to resolve job for event");
                Err(DispatchOutcome::Failed(e.to_string()))
            }
        }
    }

    async fn load(&self, job_id: i64) -> Result<Job> {
        self.store
            .get(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))
    }

    /// Record an event and submit finalization on exit.
    async fn on_event(
        &self,
        job_id: i64,
        event: BackendEvent,
        origin: EntryOrigin,
    ) -> Result<DispatchOutcome> {
        if event.ignore {
            return Ok(DispatchOutcome::Ignored);
        }
        let mut job = self.load(job_id).await?;
        let previous = job.status.clone();

        if event.job.kind.is_service_based()
            && let Some(task_id) = &event.job.task_id
        {
            job.task_id = Some(task_id.clone());
        }
        if event.node_id.is_some() {
            job.node_id = event.node_id.clone();
        }

        let appended = job.append_history(HistoryEntry::from_event(&event, origin));
        if appended != AppendOutcome::Duplicate {
            self.store.save(&job).await?;
        }
        if appended == AppendOutcome::Applied && job.status != previous {
            debug!(
                job_id,
                native_id = job.native_id().unwrap_or("-"),
                from = %previous,
                to = %job.status,
                "Job status changed"
            );
            self.notifier.trigger_event(EngineEvent::StatusChanged {
                job_id,
                previous,
                status: job.status.clone(),
            });
        }

        if event.is_exit && job.finalization == FinalizationState::Pending {
            info!(
                job_id,
                native_id = job.native_id().unwrap_or("-"),
                status = %job.status,
                exit_code = ?event.exit_code,
                "Exit event received, submitting finalization"
            );
            self.finalizer
                .submit(job_id, event.exit_code, event.succeeded());
            return Ok(DispatchOutcome::FinalizationSubmitted);
        }

        Ok(match appended {
            AppendOutcome::Duplicate => DispatchOutcome::Duplicate,
            AppendOutcome::Recorded => DispatchOutcome::Recorded,
            AppendOutcome::Applied => DispatchOutcome::Applied,
        })
    }

    /// Look for service-level confirmation of a job that stopped running.
    ///
    /// Applies to waiting jobs and to terminal jobs whose finalization was
    /// never submitted (killed, or a failed task of a live service).
    async fn on_waiting(&self, job_id: i64) -> Result<DispatchOutcome> {
        let job = self.load(job_id).await?;
        if job.finalization != FinalizationState::Pending || job.status == JobStatus::Finalizing {
            return Ok(DispatchOutcome::Skipped);
        }
        if !job.status.is_waiting() && !job.is_terminal() {
            debug!(job_id, status = %job.status, "Job no longer waiting");
            return Ok(DispatchOutcome::Skipped);
        }

        let job_ref = job
            .job_ref()
            .ok_or_else(|| Error::InvalidState(format!("{} has no native id", job.describe())))?;
        let adapter = self
            .adapters
            .get(job.backend)
            .ok_or(Error::NoAdapter(job.backend))?;

        match with_timeout(self.config.backend_timeout, adapter.describe(&job_ref)).await {
            Ok(event) if event.is_exit => {
                self.on_event(job_id, event, EntryOrigin::TaskSnapshot).await
            }
            Ok(_) if self.waited_too_long(&job) => Ok(self.finalize_stuck(&job)),
            Ok(_) => Ok(DispatchOutcome::StillWaiting),
            Err(BackendError::NotFound(_)) => {
                info!(
                    job_id,
                    native_id = %job_ref.native_id,
                    status = %job.status,
                    "Service gone, finalizing from last history entry"
                );
                Ok(self.finalize_from_history(&job))
            }
            Err(e) if self.waited_too_long(&job) => {
                warn!(job_id, error = %e, "Backend unavailable for long-waiting job");
                Ok(self.finalize_stuck(&job))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn waited_too_long(&self, job: &Job) -> bool {
        let waited = Utc::now() - job.status_time;
        waited.to_std().is_ok_and(|w| w > self.config.waiting_timeout)
    }

    fn finalize_stuck(&self, job: &Job) -> DispatchOutcome {
        warn!(
            job_id = job.id,
            native_id = job.native_id().unwrap_or("-"),
            timeout = ?self.config.waiting_timeout,
            "No service-level confirmation in time, finalizing from last history entry"
        );
        self.finalize_from_history(job)
    }

    fn finalize_from_history(&self, job: &Job) -> DispatchOutcome {
        let exit_code = job.last_exit_code();
        let success = !job.status.is_failure() && exit_code.unwrap_or(0) == 0;
        self.finalizer.submit(job.id, exit_code, success);
        DispatchOutcome::FinalizationSubmitted
    }
}
