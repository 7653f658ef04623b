// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process collaborator implementations.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ChainRepository, CollaboratorError, EngineEvent, LaunchRequest, Launcher, NewWorkflow,
    Notifier, OutputHandler, Workflow, WorkflowService,
};
use crate::backend::BackendKind;
use crate::job::{HistoryEntry, Job, OrchestrationRef, OutputSpec, OutputValue};
use crate::orchestration::{Orchestration, OrchestrationScope};
use crate::persistence::JobStore;
use crate::status::JobStatus;

/// Launcher that records jobs in a [`JobStore`] without starting anything.
///
/// Native ids are `<template>-<n>`.
pub struct MemoryLauncher {
    store: Arc<dyn JobStore>,
    backend: BackendKind,
    counter: AtomicU64,
    requests: Mutex<Vec<LaunchRequest>>,
    rejected_templates: Mutex<HashSet<String>>,
}

impl MemoryLauncher {
    /// Create a launcher for one backend kind.
    pub fn new(store: Arc<dyn JobStore>, backend: BackendKind) -> Self {
        Self {
            store,
            backend,
            counter: AtomicU64::new(0),
            requests: Mutex::new(Vec::new()),
            rejected_templates: Mutex::new(HashSet::new()),
        }
    }

    /// Make launches of `template` fail.
    pub async fn reject_template(&self, template: &str) {
        self.rejected_templates
            .lock()
            .await
            .insert(template.to_string());
    }

    /// Requests received so far.
    pub async fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl Launcher for MemoryLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<Job, CollaboratorError> {
        self.requests.lock().await.push(request.clone());

        let template = &request.step.template;
        if self.rejected_templates.lock().await.contains(template) {
            return Err(CollaboratorError::Rejected(format!(
                "template '{}' cannot be resolved",
                template
            )));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let native_id = format!("{}-{}", template, n);
        let mut job = match self.backend {
            BackendKind::Plain => Job::new(self.backend).with_container_id(native_id),
            BackendKind::Swarm | BackendKind::Cluster => {
                Job::new(self.backend).with_service(native_id, None)
            }
        };
        job.subtype = request.subtype;
        job.parent_id = request.parent_id;
        job.project = request.project.clone();
        job.username = request.username.clone();
        job.outputs = request.step.outputs.clone();
        if let Some(workflow) = &request.workflow {
            job.workflow_id = Some(workflow.id.clone());
            if let (Some(chain_id), Some(step_index)) = (workflow.chain_ref, workflow.step_index) {
                job.orchestration = Some(OrchestrationRef {
                    chain_id,
                    step_index,
                    parent_workflow_id: workflow.parent_workflow_id.clone(),
                });
            }
        }
        job.append_history(HistoryEntry::system(
            JobStatus::Created,
            format!("Launched from template {}", template),
        ));

        self.store
            .create(job)
            .await
            .map_err(|e| CollaboratorError::Rejected(e.to_string()))
    }
}

/// Workflow service kept in memory.
#[derive(Default)]
pub struct MemoryWorkflows {
    workflows: Mutex<HashMap<String, Workflow>>,
}

impl MemoryWorkflows {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a workflow.
    pub async fn insert(&self, workflow: Workflow) {
        self.workflows
            .lock()
            .await
            .insert(workflow.id.clone(), workflow);
    }

    /// All workflows, in no particular order.
    pub async fn all(&self) -> Vec<Workflow> {
        self.workflows.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl WorkflowService for MemoryWorkflows {
    async fn get(&self, id: &str) -> Result<Option<Workflow>, CollaboratorError> {
        Ok(self.workflows.lock().await.get(id).cloned())
    }

    async fn create(&self, request: NewWorkflow) -> Result<Workflow, CollaboratorError> {
        let workflow = Workflow {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Created,
            details: None,
            chain_ref: request.chain_ref,
            step_index: request.step_index,
            project: request.project,
            parent_workflow_id: request.parent_workflow_id,
            inputs: request.inputs,
        };
        self.insert(workflow.clone()).await;
        Ok(workflow)
    }

    async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        details: Option<String>,
    ) -> Result<(), CollaboratorError> {
        let mut workflows = self.workflows.lock().await;
        let workflow = workflows
            .get_mut(id)
            .ok_or_else(|| CollaboratorError::NotFound(format!("workflow {}", id)))?;
        workflow.status = status;
        workflow.details = details;
        Ok(())
    }
}

/// Notifier that keeps every event.
#[derive(Default)]
pub struct RecordingNotifier {
    events: StdMutex<Vec<EngineEvent>>,
}

impl RecordingNotifier {
    /// Create an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far.
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Notifier for RecordingNotifier {
    fn trigger_event(&self, event: EngineEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

/// Output handler that derives values from the job's native id.
///
/// The value of an output is `<native id>/<path or name>` unless overridden.
#[derive(Default)]
pub struct StaticOutputHandler {
    overrides: Mutex<HashMap<String, Option<String>>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl StaticOutputHandler {
    /// Create a handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the value of an output (`None`: the job produced nothing).
    pub async fn set_value(&self, name: &str, value: Option<String>) {
        self.overrides.lock().await.insert(name.to_string(), value);
    }

    /// Make handling of an output fail.
    pub async fn fail_output(&self, name: &str) {
        self.failing.lock().await.insert(name.to_string());
    }

    /// Output names in the order they were handled.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl OutputHandler for StaticOutputHandler {
    async fn handle_output(
        &self,
        job: &Job,
        spec: &OutputSpec,
        _resolved: &[OutputValue],
    ) -> Result<Option<String>, CollaboratorError> {
        self.calls.lock().await.push(spec.name.clone());
        if self.failing.lock().await.contains(&spec.name) {
            return Err(CollaboratorError::Unavailable(format!(
                "output store rejected {}",
                spec.name
            )));
        }
        if let Some(value) = self.overrides.lock().await.get(&spec.name) {
            return Ok(value.clone());
        }
        Ok(Some(format!(
            "{}/{}",
            job.native_id().unwrap_or("job"),
            spec.path.as_deref().unwrap_or(&spec.name)
        )))
    }
}

/// Chain repository kept in memory.
#[derive(Default)]
pub struct MemoryChains {
    chains: Mutex<HashMap<i64, Orchestration>>,
}

impl MemoryChains {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a chain.
    pub async fn insert(&self, chain: Orchestration) {
        self.chains.lock().await.insert(chain.id, chain);
    }
}

#[async_trait]
impl ChainRepository for MemoryChains {
    async fn get(&self, id: i64) -> Result<Option<Orchestration>, CollaboratorError> {
        Ok(self.chains.lock().await.get(&id).cloned())
    }

    async fn for_project(
        &self,
        project: Option<&str>,
    ) -> Result<Option<Orchestration>, CollaboratorError> {
        let chains = self.chains.lock().await;
        let mut enabled: Vec<&Orchestration> = chains.values().filter(|c| c.enabled).collect();
        enabled.sort_by_key(|c| c.id);

        if let Some(project) = project
            && let Some(chain) = enabled
                .iter()
                .find(|c| matches!(&c.scope, OrchestrationScope::Project(p) if p == project))
        {
            return Ok(Some((*chain).clone()));
        }
        Ok(enabled
            .into_iter()
            .find(|c| c.scope == OrchestrationScope::Site)
            .cloned())
    }
}
