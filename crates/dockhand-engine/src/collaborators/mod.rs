// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interfaces to the application the engine is embedded in.
//!
//! The engine launches jobs, resolves outputs and tracks workflows only through
//! these traits. [`memory`] holds in-process implementations used by the tests
//! and by embedders that have no external workflow system.

pub mod memory;

pub use self::memory::{
    MemoryChains, MemoryLauncher, MemoryWorkflows, RecordingNotifier, StaticOutputHandler,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Job, JobSubtype, OutputSpec, OutputValue};
use crate::orchestration::{Orchestration, StepSpec};
use crate::status::JobStatus;

/// Errors reported by collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CollaboratorError {
    /// The collaborator could not be reached.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// A referenced object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request was refused (invalid template, permission, quota).
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// A value bound to a step input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundInput {
    /// Input name.
    pub name: String,
    /// Bound value.
    pub value: String,
}

/// External workflow correlated with a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    /// Opaque workflow id.
    pub id: String,
    /// Current status.
    pub status: JobStatus,
    /// Status details.
    pub details: Option<String>,
    /// Orchestration chain this workflow is a step of.
    pub chain_ref: Option<i64>,
    /// Index of that step.
    pub step_index: Option<usize>,
    /// Owning project.
    pub project: Option<String>,
    /// Workflow wrapping the whole chain.
    pub parent_workflow_id: Option<String>,
    /// Inputs the step was launched with.
    pub inputs: Vec<BoundInput>,
}

impl Workflow {
    /// Whether the workflow ended unsuccessfully.
    pub fn is_failed(&self) -> bool {
        self.status.is_failure()
    }
}

/// Request to create a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewWorkflow {
    /// Orchestration chain.
    pub chain_ref: Option<i64>,
    /// Step index.
    pub step_index: Option<usize>,
    /// Owning project.
    pub project: Option<String>,
    /// Workflow wrapping the whole chain.
    pub parent_workflow_id: Option<String>,
    /// Inputs.
    pub inputs: Vec<BoundInput>,
}

/// Request to launch one job.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    /// What to run.
    pub step: StepSpec,
    /// Bound inputs.
    pub inputs: Vec<BoundInput>,
    /// Workflow the job belongs to.
    pub workflow: Option<Workflow>,
    /// Parent job for setup/wrap-up jobs.
    pub parent_id: Option<i64>,
    /// Role of the job.
    pub subtype: JobSubtype,
    /// Owning project.
    pub project: Option<String>,
    /// Launching user.
    pub username: Option<String>,
}

impl LaunchRequest {
    /// Main job of a workflow step.
    pub fn for_step(step: StepSpec, inputs: Vec<BoundInput>, workflow: Workflow) -> Self {
        Self {
            step,
            inputs,
            project: workflow.project.clone(),
            workflow: Some(workflow),
            parent_id: None,
            subtype: JobSubtype::Main,
            username: None,
        }
    }

    /// Wrap-up job processing the outputs of `parent`.
    pub fn wrap_up(step: StepSpec, inputs: Vec<BoundInput>, parent: &Job) -> Self {
        Self {
            step,
            inputs,
            workflow: None,
            parent_id: Some(parent.id),
            subtype: JobSubtype::WrapUp,
            project: parent.project.clone(),
            username: parent.username.clone(),
        }
    }
}

/// Notification published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A job's status moved.
    StatusChanged {
        /// Job id.
        job_id: i64,
        /// Previous status.
        previous: JobStatus,
        /// New status.
        status: JobStatus,
    },
    /// A job was finalized.
    Finalized {
        /// Job id.
        job_id: i64,
        /// Final status.
        status: JobStatus,
        /// Correlated workflow.
        workflow_id: Option<String>,
    },
    /// An orchestration step could not be started and no workflow carries the error.
    OrchestrationFailed {
        /// Chain id.
        chain_id: i64,
        /// Step that could not be started.
        step_index: usize,
        /// Error description.
        error: String,
    },
}

/// Creates and starts backend jobs from step templates.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launch a job and return it as stored.
    async fn launch(&self, request: LaunchRequest) -> Result<Job, CollaboratorError>;
}

/// External workflow tracking.
#[async_trait]
pub trait WorkflowService: Send + Sync {
    /// Load a workflow.
    async fn get(&self, id: &str) -> Result<Option<Workflow>, CollaboratorError>;

    /// Create a workflow in `Created` state.
    async fn create(&self, request: NewWorkflow) -> Result<Workflow, CollaboratorError>;

    /// Set a workflow's status.
    async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        details: Option<String>,
    ) -> Result<(), CollaboratorError>;
}

/// Fire-and-forget event sink.
pub trait Notifier: Send + Sync {
    /// Publish an event. Must not block.
    fn trigger_event(&self, event: EngineEvent);
}

/// Resolves declared outputs of a finished job.
#[async_trait]
pub trait OutputHandler: Send + Sync {
    /// Handle one output. `resolved` holds the outputs already handled.
    ///
    /// Returns the output value, or `None` if the job produced nothing for it.
    async fn handle_output(
        &self,
        job: &Job,
        spec: &OutputSpec,
        resolved: &[OutputValue],
    ) -> Result<Option<String>, CollaboratorError>;
}

/// Orchestration chain definitions.
#[async_trait]
pub trait ChainRepository: Send + Sync {
    /// Load a chain by id.
    async fn get(&self, id: i64) -> Result<Option<Orchestration>, CollaboratorError>;

    /// The enabled chain for a project: the project's own chain, else the site default.
    async fn for_project(
        &self,
        project: Option<&str>,
    ) -> Result<Option<Orchestration>, CollaboratorError>;
}
