// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job persistence.
//!
//! The engine depends only on [`JobStore`]. Two implementations ship with the
//! crate: [`MemoryJobStore`] for tests and embedding, and [`SqliteJobStore`]
//! backed by sqlx with embedded migrations.
//!
//! # Save semantics
//!
//! Several paths (reconciliation tick, push listener, finalization) may hold
//! copies of the same job. A save is therefore a merge into the stored record:
//! - history is append-only; entries already stored are kept
//! - `status`/`status_time` move only if the incoming status time is not older,
//!   and never from a terminal to a non-terminal status
//! - the finalization state never moves backwards
//! - resolved output values are only replaced by a non-empty set

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryJobStore;
pub use self::sqlite::SqliteJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::backend::BackendKind;
use crate::job::Job;

/// Errors from job store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The job does not exist.
    #[error("Job not found: {0}")]
    NotFound(i64),

    /// Another active job already owns the backend-native id.
    #[error("Active job {existing} already uses {backend} id {native_id}")]
    ActiveDuplicate {
        /// Backend kind.
        backend: BackendKind,
        /// Backend-native id.
        native_id: String,
        /// Id of the active job.
        existing: i64,
    },

    /// A stored row could not be mapped back to a job.
    #[error("Corrupt job record {id}: {reason}")]
    Corrupt {
        /// Job id.
        id: i64,
        /// What was wrong.
        reason: String,
    },
}

/// Persistence interface for job aggregates.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Load a job by id.
    async fn get(&self, id: i64) -> Result<Option<Job>, StoreError>;

    /// Load the job a backend-native id belongs to.
    ///
    /// If several jobs share the id (a re-launch after a terminal run), the
    /// non-terminal one wins, then the most recently created.
    async fn get_by_native_id(
        &self,
        backend: BackendKind,
        native_id: &str,
    ) -> Result<Option<Job>, StoreError>;

    /// Store a new job and return it with its assigned id.
    ///
    /// Fails with [`StoreError::ActiveDuplicate`] if a non-terminal job
    /// already uses the same backend-native id.
    async fn create(&self, job: Job) -> Result<Job, StoreError>;

    /// Merge a job into the stored record (see the module docs).
    async fn save(&self, job: &Job) -> Result<(), StoreError>;

    /// Jobs whose status is not terminal, optionally for one backend.
    async fn list_non_terminal(&self, backend: Option<BackendKind>) -> Result<Vec<Job>, StoreError>;

    /// Jobs the reconciler still has to look at: non-terminal ones, and
    /// terminal ones whose finalization has not been claimed yet.
    async fn list_unfinalized(&self, backend: Option<BackendKind>) -> Result<Vec<Job>, StoreError>;

    /// Jobs whose status starts with `prefix`.
    async fn list_by_status(&self, prefix: &str) -> Result<Vec<Job>, StoreError>;

    /// Atomically move finalization from pending to claimed.
    ///
    /// Returns false if another caller already claimed it.
    async fn try_claim_finalization(&self, id: i64) -> Result<bool, StoreError>;

    /// When the event stream of a backend was last read successfully.
    async fn last_event_check(&self, backend: BackendKind)
    -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Advance the event stream watermark of a backend.
    async fn set_last_event_check(
        &self,
        backend: BackendKind,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Merge an incoming copy of a job into the stored one.
pub(crate) fn merge_job(stored: &mut Job, incoming: &Job) {
    for entry in incoming.history.iter() {
        stored.history.insert(entry.clone());
    }

    let regresses = stored.status.is_terminal() && !incoming.status.is_terminal();
    if incoming.status_time >= stored.status_time && !regresses {
        stored.status = incoming.status.clone();
        stored.status_time = incoming.status_time;
    }

    stored.finalization = stored.finalization.max(incoming.finalization);

    if !incoming.output_values.is_empty() {
        stored.output_values = incoming.output_values.clone();
    }

    stored.container_id = incoming.container_id.clone();
    stored.service_id = incoming.service_id.clone();
    stored.task_id = incoming.task_id.clone();
    stored.node_id = incoming.node_id.clone();
    stored.subtype = incoming.subtype;
    stored.parent_id = incoming.parent_id;
    stored.workflow_id = incoming.workflow_id.clone();
    stored.orchestration = incoming.orchestration.clone();
    stored.project = incoming.project.clone();
    stored.username = incoming.username.clone();
    stored.outputs = incoming.outputs.clone();
    stored.wrapup_steps = incoming.wrapup_steps.clone();
}
