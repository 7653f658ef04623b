// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Adapter for swarm services.
//!
//! A job is one service. Its tasks come and go (restarts, rescheduling), so a
//! single task reaching a final state is not enough: the job only exits once
//! every task of the service is final.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{BackendAdapter, BackendError, BackendEvent, BackendKind, ClientError, JobRef};

/// Task states after which a task never runs again.
const FINAL_TASK_STATES: [&str; 7] = [
    "complete", "failed", "rejected", "shutdown", "orphaned", "remove", "oom",
];

/// One task of a swarm service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskState {
    /// Task id.
    pub task_id: String,
    /// Owning service id.
    pub service_id: String,
    /// Node the task was scheduled on.
    pub node_id: Option<String>,
    /// Observed task state.
    pub state: String,
    /// State the orchestrator wants the task in.
    pub desired_state: String,
    /// Status message.
    pub message: Option<String>,
    /// Error string, if the task failed.
    pub error: Option<String>,
    /// Container exit code.
    pub exit_code: Option<i64>,
    /// When the state was last updated.
    pub timestamp: DateTime<Utc>,
}

impl TaskState {
    fn is_final(&self) -> bool {
        FINAL_TASK_STATES.contains(&self.state.to_ascii_lowercase().as_str())
    }
}

/// Abstract client for the swarm API.
#[async_trait]
pub trait SwarmClient: Send + Sync {
    /// Ping the swarm manager.
    async fn ping(&self) -> Result<(), ClientError>;

    /// Whether the service still exists.
    async fn service_exists(&self, service_id: &str) -> Result<bool, ClientError>;

    /// All tasks of a service, including finished ones.
    async fn service_tasks(&self, service_id: &str) -> Result<Vec<TaskState>, ClientError>;

    /// Ids of all services.
    async fn list_services(&self) -> Result<Vec<String>, ClientError>;

    /// Remove a service.
    async fn remove_service(&self, service_id: &str) -> Result<(), ClientError>;
}

/// Swarm service adapter.
pub struct SwarmAdapter {
    client: Arc<dyn SwarmClient>,
}

impl SwarmAdapter {
    /// Create an adapter over a swarm client.
    pub fn new(client: Arc<dyn SwarmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BackendAdapter for SwarmAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Swarm
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.client
            .ping()
            .await
            .map_err(|e| e.into_backend_error("swarm manager"))
    }

    async fn list_active_jobs(&self) -> Result<Vec<JobRef>, BackendError> {
        let services = self
            .client
            .list_services()
            .await
            .map_err(|e| e.into_backend_error("service list"))?;
        Ok(services
            .into_iter()
            .map(|id| JobRef::new(BackendKind::Swarm, id))
            .collect())
    }

    async fn describe(&self, job: &JobRef) -> Result<BackendEvent, BackendError> {
        let service_id = job.native_id.as_str();
        let exists = self
            .client
            .service_exists(service_id)
            .await
            .map_err(|e| e.into_backend_error(service_id))?;
        if !exists {
            return Err(BackendError::NotFound(service_id.to_string()));
        }

        let tasks = self
            .client
            .service_tasks(service_id)
            .await
            .map_err(|e| e.into_backend_error(service_id))?;

        let task = match &job.task_id {
            Some(task_id) => tasks.iter().find(|t| &t.task_id == task_id),
            None => tasks.iter().max_by_key(|t| t.timestamp),
        }
        .ok_or_else(|| BackendError::LookupFailed {
            job: job.to_string(),
            reason: if tasks.is_empty() {
                "service has no tasks".to_string()
            } else {
                "task not found in service".to_string()
            },
        })?;

        let service_done = tasks.iter().all(TaskState::is_final);

        let mut attributes = HashMap::new();
        attributes.insert("desired_state".to_string(), task.desired_state.clone());
        if let Some(error) = &task.error {
            attributes.insert("error".to_string(), error.clone());
        }

        let message = task
            .error
            .clone()
            .or_else(|| task.message.clone())
            .filter(|m| !m.is_empty());

        let mut job_ref = job.clone();
        job_ref.task_id = Some(task.task_id.clone());

        Ok(BackendEvent::new(job_ref, task.state.clone(), attributes)
            .with_exit_code(task.exit_code)
            .with_timestamp(Some(task.timestamp))
            .with_message(message)
            .with_node(task.node_id.clone())
            .exit(task.is_final() && service_done))
    }

    async fn kill(&self, job: &JobRef) -> Result<(), BackendError> {
        self.client
            .remove_service(&job.native_id)
            .await
            .map_err(|e| e.into_backend_error(&job.native_id))
    }
}
