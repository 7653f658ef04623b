// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed job store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};

use super::{JobStore, StoreError, merge_job};
use crate::backend::BackendKind;
use crate::job::{
    EntryOrigin, FinalizationState, History, HistoryEntry, Job, JobSubtype, OrchestrationRef,
};
use crate::status::{JobStatus, TERMINAL_PREFIXES, is_terminal_status};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const JOB_COLUMNS: &str = "id, backend, container_id, service_id, task_id, node_id, status, \
     status_time, subtype, parent_id, workflow_id, orchestration, project, username, outputs, \
     output_values, wrapup_steps, finalization, created_at";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    backend: String,
    container_id: Option<String>,
    service_id: Option<String>,
    task_id: Option<String>,
    node_id: Option<String>,
    status: String,
    status_time: DateTime<Utc>,
    subtype: String,
    parent_id: Option<i64>,
    workflow_id: Option<String>,
    orchestration: Option<String>,
    project: Option<String>,
    username: Option<String>,
    outputs: String,
    output_values: String,
    wrapup_steps: String,
    finalization: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    status: String,
    origin: String,
    origin_id: Option<String>,
    recorded_at: DateTime<Utc>,
    external_timestamp: Option<DateTime<Utc>>,
    message: Option<String>,
    exit_code: Option<i64>,
}

impl HistoryRow {
    fn into_entry(self, job_id: i64) -> Result<HistoryEntry, StoreError> {
        let origin = EntryOrigin::parse(&self.origin).ok_or_else(|| StoreError::Corrupt {
            id: job_id,
            reason: format!("unknown history origin '{}'", self.origin),
        })?;
        Ok(HistoryEntry {
            status: JobStatus::parse(&self.status),
            origin,
            origin_id: self.origin_id,
            recorded_at: self.recorded_at,
            external_timestamp: self.external_timestamp,
            message: self.message,
            exit_code: self.exit_code,
        })
    }
}

impl JobRow {
    fn into_job(self, history: Vec<HistoryRow>) -> Result<Job, StoreError> {
        let id = self.id;
        let backend = BackendKind::parse(&self.backend).ok_or_else(|| StoreError::Corrupt {
            id,
            reason: format!("unknown backend '{}'", self.backend),
        })?;
        let orchestration = self
            .orchestration
            .as_deref()
            .map(serde_json::from_str::<OrchestrationRef>)
            .transpose()?;
        let entries = history
            .into_iter()
            .map(|row| row.into_entry(id))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Job {
            id,
            backend,
            container_id: self.container_id,
            service_id: self.service_id,
            task_id: self.task_id,
            node_id: self.node_id,
            status: JobStatus::parse(&self.status),
            status_time: self.status_time,
            history: History::from_entries(entries),
            subtype: JobSubtype::parse(&self.subtype),
            parent_id: self.parent_id,
            workflow_id: self.workflow_id,
            orchestration,
            project: self.project,
            username: self.username,
            outputs: serde_json::from_str(&self.outputs)?,
            output_values: serde_json::from_str(&self.output_values)?,
            wrapup_steps: serde_json::from_str(&self.wrapup_steps)?,
            finalization: FinalizationState::parse(&self.finalization),
            created_at: self.created_at,
        })
    }
}

/// `status` does not start with any terminal prefix.
fn non_terminal_clause() -> String {
    TERMINAL_PREFIXES
        .iter()
        .map(|prefix| format!("status NOT GLOB '{}*'", prefix))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// SQLite-backed job store.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Open (creating if needed) a database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
        }
        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load(conn: &mut SqliteConnection, id: i64) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => {
                let history = Self::load_history(conn, id).await?;
                Ok(Some(row.into_job(history)?))
            }
            None => Ok(None),
        }
    }

    async fn load_history(
        conn: &mut SqliteConnection,
        job_id: i64,
    ) -> Result<Vec<HistoryRow>, StoreError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT status, origin, origin_id, recorded_at, external_timestamp, message, exit_code
            FROM job_history
            WHERE job_id = ?
            ORDER BY id
            "#,
        )
        .bind(job_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    async fn load_many(&self, rows: Vec<JobRow>) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let history = Self::load_history(&mut conn, row.id).await?;
            jobs.push(row.into_job(history)?);
        }
        Ok(jobs)
    }

    async fn insert_history(
        conn: &mut SqliteConnection,
        job_id: i64,
        entry: &HistoryEntry,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_history
                (job_id, status, origin, origin_id, recorded_at, external_timestamp, message, exit_code)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(entry.status.to_string())
        .bind(entry.origin.as_str())
        .bind(&entry.origin_id)
        .bind(entry.recorded_at)
        .bind(entry.external_timestamp)
        .bind(&entry.message)
        .bind(entry.exit_code)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn get(&self, id: i64) -> Result<Option<Job>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::load(&mut conn, id).await
    }

    async fn get_by_native_id(
        &self,
        backend: BackendKind,
        native_id: &str,
    ) -> Result<Option<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE backend = ? AND native_id = ? ORDER BY created_at DESC, id DESC",
            JOB_COLUMNS
        ))
        .bind(backend.as_str())
        .bind(native_id)
        .fetch_all(&self.pool)
        .await?;

        let pick = rows
            .iter()
            .position(|row| !is_terminal_status(&row.status))
            .unwrap_or(0);
        match rows.into_iter().nth(pick) {
            Some(row) => Ok(self.load_many(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn create(&self, mut job: Job) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(native_id) = job.native_id() {
            let active: Vec<(i64, String)> = sqlx::query_as(
                "SELECT id, status FROM jobs WHERE backend = ? AND native_id = ?",
            )
            .bind(job.backend.as_str())
            .bind(native_id)
            .fetch_all(&mut *tx)
            .await?;
            if let Some((existing, _)) = active
                .into_iter()
                .find(|(_, status)| !is_terminal_status(status))
            {
                return Err(StoreError::ActiveDuplicate {
                    backend: job.backend,
                    native_id: native_id.to_string(),
                    existing,
                });
            }
        }

        let result = sqlx::query(
            r#"
            INSERT INTO jobs
                (backend, native_id, container_id, service_id, task_id, node_id, status,
                 status_time, subtype, parent_id, workflow_id, orchestration, project, username,
                 outputs, output_values, wrapup_steps, finalization, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.backend.as_str())
        .bind(job.native_id())
        .bind(&job.container_id)
        .bind(&job.service_id)
        .bind(&job.task_id)
        .bind(&job.node_id)
        .bind(job.status.to_string())
        .bind(job.status_time)
        .bind(job.subtype.as_str())
        .bind(job.parent_id)
        .bind(&job.workflow_id)
        .bind(
            job.orchestration
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&job.project)
        .bind(&job.username)
        .bind(serde_json::to_string(&job.outputs)?)
        .bind(serde_json::to_string(&job.output_values)?)
        .bind(serde_json::to_string(&job.wrapup_steps)?)
        .bind(job.finalization.as_str())
        .bind(job.created_at)
        .execute(&mut *tx)
        .await?;

        job.id = result.last_insert_rowid();
        for entry in job.history.iter() {
            Self::insert_history(&mut tx, job.id, entry).await?;
        }
        tx.commit().await?;
        Ok(job)
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut stored = Self::load(&mut tx, job.id)
            .await?
            .ok_or(StoreError::NotFound(job.id))?;

        let new_entries: Vec<HistoryEntry> = job
            .history
            .iter()
            .filter(|entry| !stored.history.contains_equivalent(entry))
            .cloned()
            .collect();
        merge_job(&mut stored, job);

        sqlx::query(
            r#"
            UPDATE jobs
            SET native_id = ?, container_id = ?, service_id = ?, task_id = ?, node_id = ?,
                status = ?, status_time = ?, subtype = ?, parent_id = ?, workflow_id = ?,
                orchestration = ?, project = ?, username = ?, outputs = ?, output_values = ?,
                wrapup_steps = ?, finalization = ?
            WHERE id = ?
            "#,
        )
        .bind(stored.native_id())
        .bind(&stored.container_id)
        .bind(&stored.service_id)
        .bind(&stored.task_id)
        .bind(&stored.node_id)
        .bind(stored.status.to_string())
        .bind(stored.status_time)
        .bind(stored.subtype.as_str())
        .bind(stored.parent_id)
        .bind(&stored.workflow_id)
        .bind(
            stored
                .orchestration
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&stored.project)
        .bind(&stored.username)
        .bind(serde_json::to_string(&stored.outputs)?)
        .bind(serde_json::to_string(&stored.output_values)?)
        .bind(serde_json::to_string(&stored.wrapup_steps)?)
        .bind(stored.finalization.as_str())
        .bind(stored.id)
        .execute(&mut *tx)
        .await?;

        for entry in &new_entries {
            Self::insert_history(&mut tx, stored.id, entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_non_terminal(&self, backend: Option<BackendKind>) -> Result<Vec<Job>, StoreError> {
        let rows = match backend {
            Some(kind) => {
                sqlx::query_as::<_, JobRow>(&format!(
                    "SELECT {} FROM jobs WHERE backend = ? AND {} ORDER BY id",
                    JOB_COLUMNS,
                    non_terminal_clause()
                ))
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>(&format!(
                    "SELECT {} FROM jobs WHERE {} ORDER BY id",
                    JOB_COLUMNS,
                    non_terminal_clause()
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        self.load_many(rows).await
    }

    async fn list_unfinalized(&self, backend: Option<BackendKind>) -> Result<Vec<Job>, StoreError> {
        let filter = format!("(finalization = 'pending' OR ({}))", non_terminal_clause());
        let rows = match backend {
            Some(kind) => {
                sqlx::query_as::<_, JobRow>(&format!(
                    "SELECT {} FROM jobs WHERE backend = ? AND {} ORDER BY id",
                    JOB_COLUMNS, filter
                ))
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>(&format!(
                    "SELECT {} FROM jobs WHERE {} ORDER BY id",
                    JOB_COLUMNS, filter
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        self.load_many(rows).await
    }

    async fn list_by_status(&self, prefix: &str) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE substr(status, 1, length(?)) = ? ORDER BY id",
            JOB_COLUMNS
        ))
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        self.load_many(rows).await
    }

    async fn try_claim_finalization(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET finalization = 'claimed' WHERE id = ? AND finalization = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn last_event_check(
        &self,
        backend: BackendKind,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT checked_at FROM backend_event_checks WHERE backend = ?")
                .bind(backend.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(at,)| at))
    }

    async fn set_last_event_check(
        &self,
        backend: BackendKind,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO backend_event_checks (backend, checked_at)
            VALUES (?, ?)
            ON CONFLICT(backend) DO UPDATE SET checked_at = excluded.checked_at
            "#,
        )
        .bind(backend.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
