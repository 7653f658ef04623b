// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Adapter for a single-host container engine.
//!
//! The engine exposes a time-windowed event stream (`create`, `start`,
//! `oom`, `kill`, `die`, `destroy`, ...). Only `die` is an exit event;
//! `destroy` and exec/attach chatter are noise.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{BackendAdapter, BackendError, BackendEvent, BackendKind, ClientError, JobRef};

/// Raw action reported by the engine event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    /// Container id.
    pub container_id: String,
    /// Event action, e.g. `die` or `exec_start: sh -c ls`.
    pub action: String,
    /// When the engine emitted the event.
    pub time: DateTime<Utc>,
    /// Actor attributes (`exitCode`, `signal`, labels).
    pub attributes: HashMap<String, String>,
}

/// Inspect result for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    /// Engine status: created, running, paused, restarting, exited, dead.
    pub status: String,
    /// Exit code once exited.
    pub exit_code: Option<i64>,
    /// Whether the kernel OOM killer stopped the container.
    pub oom_killed: bool,
    /// When the container exited.
    pub finished_at: Option<DateTime<Utc>>,
    /// Engine error string.
    pub error: Option<String>,
}

/// Abstract client for the container engine API.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Ping the engine.
    async fn ping(&self) -> Result<(), ClientError>;

    /// Container events in `[since, until)`.
    async fn events(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ContainerEvent>, ClientError>;

    /// Inspect a container. `None` when the engine no longer knows it.
    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerState>, ClientError>;

    /// Ids of containers that are not exited.
    async fn list_running(&self) -> Result<Vec<String>, ClientError>;

    /// Kill and remove a container.
    async fn kill(&self, container_id: &str) -> Result<(), ClientError>;
}

/// Actions that follow an exit or never change the job's state.
const NOISE_PREFIXES: [&str; 12] = [
    "destroy",
    "exec_",
    "attach",
    "detach",
    "resize",
    "top",
    "commit",
    "copy",
    "archive-path",
    "extract-to-dir",
    "export",
    "health_status",
];

/// Container engine adapter.
pub struct PlainAdapter {
    client: Arc<dyn EngineClient>,
}

impl PlainAdapter {
    /// Create an adapter over an engine client.
    pub fn new(client: Arc<dyn EngineClient>) -> Self {
        Self { client }
    }

    fn to_event(&self, raw: ContainerEvent) -> BackendEvent {
        let exit_code = raw
            .attributes
            .get("exitCode")
            .and_then(|code| code.parse::<i64>().ok());
        let message = match exit_code {
            Some(code) => format!("{} (exit code {})", raw.action, code),
            None => raw.action.clone(),
        };
        let is_exit = raw.action == "die";
        let ignore = self.is_noise(&raw.action);

        BackendEvent::new(
            JobRef::new(BackendKind::Plain, raw.container_id),
            raw.action,
            raw.attributes,
        )
        .with_exit_code(exit_code)
        .with_timestamp(Some(raw.time))
        .with_message(Some(message))
        .exit(is_exit)
        .ignored(ignore)
    }
}

#[async_trait]
impl BackendAdapter for PlainAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Plain
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.client
            .ping()
            .await
            .map_err(|e| e.into_backend_error("engine"))
    }

    async fn list_active_jobs(&self) -> Result<Vec<JobRef>, BackendError> {
        let running = self
            .client
            .list_running()
            .await
            .map_err(|e| e.into_backend_error("container list"))?;
        Ok(running
            .into_iter()
            .map(|id| JobRef::new(BackendKind::Plain, id))
            .collect())
    }

    async fn describe(&self, job: &JobRef) -> Result<BackendEvent, BackendError> {
        let state = self
            .client
            .inspect(&job.native_id)
            .await
            .map_err(|e| e.into_backend_error(&job.native_id))?
            .ok_or_else(|| BackendError::NotFound(job.native_id.clone()))?;

        let raw_status = if state.oom_killed {
            "oom".to_string()
        } else {
            state.status.clone()
        };
        let is_exit = matches!(state.status.as_str(), "exited" | "dead");
        let message = state
            .error
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| format!("Container {}", state.status));

        Ok(
            BackendEvent::new(job.clone(), raw_status, HashMap::new())
                .with_exit_code(state.exit_code)
                .with_timestamp(state.finished_at)
                .with_message(Some(message))
                .exit(is_exit),
        )
    }

    async fn events_since(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<BackendEvent>, BackendError> {
        let raw = self
            .client
            .events(since, until)
            .await
            .map_err(|e| e.into_backend_error("event stream"))?;
        Ok(raw.into_iter().map(|event| self.to_event(event)).collect())
    }

    fn is_noise(&self, raw_status: &str) -> bool {
        NOISE_PREFIXES
            .iter()
            .any(|prefix| raw_status.starts_with(prefix))
    }

    async fn kill(&self, job: &JobRef) -> Result<(), BackendError> {
        self.client
            .kill(&job.native_id)
            .await
            .map_err(|e| e.into_backend_error(&job.native_id))
    }
}
