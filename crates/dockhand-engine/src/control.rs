// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator-facing job control: registering launched jobs and killing them.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::backend::{AdapterRegistry, with_timeout};
use crate::collaborators::{EngineEvent, Notifier};
use crate::error::{Error, Result};
use crate::job::{AppendOutcome, HistoryEntry, Job};
use crate::persistence::JobStore;
use crate::status::JobStatus;

/// Job control operations.
#[derive(Clone)]
pub struct JobControl {
    store: Arc<dyn JobStore>,
    adapters: AdapterRegistry,
    notifier: Arc<dyn Notifier>,
    backend_timeout: Duration,
}

impl JobControl {
    /// Create a controller.
    pub fn new(
        store: Arc<dyn JobStore>,
        adapters: AdapterRegistry,
        notifier: Arc<dyn Notifier>,
        backend_timeout: Duration,
    ) -> Self {
        Self {
            store,
            adapters,
            notifier,
            backend_timeout,
        }
    }

    /// Start tracking a job the launcher just started.
    ///
    /// Fails if the job has no backend-native id or another non-terminal job
    /// already uses it.
    pub async fn register_launched(&self, job: Job) -> Result<Job> {
        if job.native_id().is_none() {
            return Err(Error::InvalidState(format!(
                "{} launched without a native id",
                job.describe()
            )));
        }
        let job = self.store.create(job).await?;
        info!(
            job_id = job.id,
            backend = %job.backend,
            native_id = job.native_id().unwrap_or("-"),
            workflow_id = job.workflow_id.as_deref().unwrap_or("-"),
            "Job registered"
        );
        Ok(job)
    }

    /// Kill a running job on behalf of `username`.
    ///
    /// The backend is asked first; the `Killed` history entry is written only
    /// if it accepted.
    pub async fn kill(&self, job_id: i64, username: &str) -> Result<Job> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;
        if job.is_terminal() {
            return Err(Error::InvalidState(format!(
                "{} is already {}",
                job.describe(),
                job.status
            )));
        }
        let job_ref = job
            .job_ref()
            .ok_or_else(|| Error::InvalidState(format!("{} has no native id", job.describe())))?;
        let adapter = self
            .adapters
            .get(job.backend)
            .ok_or(Error::NoAdapter(job.backend))?;

        with_timeout(self.backend_timeout, adapter.kill(&job_ref)).await?;

        // The kill may have raced with backend events.
        let mut job = self
            .store
            .get(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;
        let previous = job.status.clone();
        let entry = HistoryEntry::user_action(
            JobStatus::Killed,
            username,
            format!("Killed by {}", username),
        );
        let appended = job.append_history(entry);
        self.store.save(&job).await?;

        info!(job_id, native_id = %job_ref.native_id, username, "Job killed");
        if appended == AppendOutcome::Applied {
            self.notifier.trigger_event(EngineEvent::StatusChanged {
                job_id,
                previous,
                status: job.status.clone(),
            });
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendAdapter, BackendKind, MockBackend};
    use crate::collaborators::memory::RecordingNotifier;
    use crate::job::EntryOrigin;
    use crate::persistence::{MemoryJobStore, StoreError};

    fn setup() -> (Arc<MemoryJobStore>, Arc<MockBackend>, Arc<RecordingNotifier>, JobControl) {
        let store = Arc::new(MemoryJobStore::new());
        let backend = Arc::new(MockBackend::new(BackendKind::Plain));
        let notifier = Arc::new(RecordingNotifier::new());
        let mut adapters = AdapterRegistry::new();
        adapters.register(backend.clone() as Arc<dyn BackendAdapter>);
        let control = JobControl::new(
            store.clone(),
            adapters,
            notifier.clone(),
            Duration::from_secs(5),
        );
        (store, backend, notifier, control)
    }

    #[tokio::test]
    async fn test_register_enforces_single_active_job() {
        let (_store, _backend, _notifier, control) = setup();

        let job = control
            .register_launched(Job::new(BackendKind::Plain).with_container_id("c1"))
            .await
            .unwrap();
        assert!(job.id > 0);

        let err = control
            .register_launched(Job::new(BackendKind::Plain).with_container_id("c1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::ActiveDuplicate { existing, .. }) if existing == job.id
        ));

        let err = control
            .register_launched(Job::new(BackendKind::Plain))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_kill_records_user_action() {
        let (store, backend, notifier, control) = setup();
        let job = control
            .register_launched(Job::new(BackendKind::Plain).with_container_id("c1"))
            .await
            .unwrap();

        let killed = control.kill(job.id, "alice").await.unwrap();
        assert_eq!(killed.status, JobStatus::Killed);
        assert_eq!(backend.killed().await.len(), 1);

        let stored = store.get(job.id).await.unwrap().unwrap();
        let entry = stored.history.latest_of(EntryOrigin::UserAction).unwrap();
        assert_eq!(entry.origin_id.as_deref(), Some("alice"));
        assert_eq!(entry.status, JobStatus::Killed);
        assert_eq!(notifier.events().len(), 1);

        let err = control.kill(job.id, "alice").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_kill_unknown_job() {
        let (_store, _backend, _notifier, control) = setup();
        let err = control.kill(42, "alice").await.unwrap_err();
        assert!(matches!(err, Error::JobNotFound(42)));
    }
}
