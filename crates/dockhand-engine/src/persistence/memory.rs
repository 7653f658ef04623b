// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory job store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{JobStore, StoreError, merge_job};
use crate::backend::BackendKind;
use crate::job::{FinalizationState, Job};

#[derive(Default)]
struct Inner {
    jobs: HashMap<i64, Job>,
    next_id: i64,
    event_checks: HashMap<BackendKind, DateTime<Utc>>,
}

/// Job store kept in process memory.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.jobs.is_empty()
    }
}

fn owns_native_id(job: &Job, backend: BackendKind, native_id: &str) -> bool {
    job.backend == backend && job.native_id() == Some(native_id)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, id: i64) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.lock().await.jobs.get(&id).cloned())
    }

    async fn get_by_native_id(
        &self,
        backend: BackendKind,
        native_id: &str,
    ) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|job| owns_native_id(job, backend, native_id))
            .max_by_key(|job| (!job.is_terminal(), job.created_at, job.id))
            .cloned())
    }

    async fn create(&self, mut job: Job) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(native_id) = job.native_id()
            && let Some(existing) = inner
                .jobs
                .values()
                .find(|j| !j.is_terminal() && owns_native_id(j, job.backend, native_id))
        {
            return Err(StoreError::ActiveDuplicate {
                backend: job.backend,
                native_id: native_id.to_string(),
                existing: existing.id,
            });
        }

        inner.next_id += 1;
        job.id = inner.next_id;
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .jobs
            .get_mut(&job.id)
            .ok_or(StoreError::NotFound(job.id))?;
        merge_job(stored, job);
        Ok(())
    }

    async fn list_non_terminal(&self, backend: Option<BackendKind>) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| !job.is_terminal())
            .filter(|job| backend.is_none_or(|b| job.backend == b))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }

    async fn list_unfinalized(&self, backend: Option<BackendKind>) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| !job.is_terminal() || job.finalization == FinalizationState::Pending)
            .filter(|job| backend.is_none_or(|b| job.backend == b))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }

    async fn list_by_status(&self, prefix: &str) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.status.to_string().starts_with(prefix))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }

    async fn try_claim_finalization(&self, id: i64) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.finalization != FinalizationState::Pending {
            return Ok(false);
        }
        job.finalization = FinalizationState::Claimed;
        Ok(true)
    }

    async fn last_event_check(
        &self,
        backend: BackendKind,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.inner.lock().await.event_checks.get(&backend).copied())
    }

    async fn set_last_event_check(
        &self,
        backend: BackendKind,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.lock().await.event_checks.insert(backend, at);
        Ok(())
    }
}
