// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestration chains: ordered multi-step pipelines.
//!
//! When the workflow of one step reaches a terminal status, the
//! [`OrchestrationController`] decides whether the chain continues, binds the
//! finished job's outputs to the next step's inputs, creates the next
//! workflow and launches it in the background.
//!
//! ```text
//!  step 0 workflow ──terminal──► controller ──► step 1 workflow ──► launch (spawned)
//!                                   │
//!                                   ├── failed + halt_on_failure ──► stop
//!                                   └── no next step ──────────────► chain finished
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collaborators::{
    BoundInput, ChainRepository, CollaboratorError, EngineEvent, LaunchRequest, Launcher,
    NewWorkflow, Notifier, Workflow, WorkflowService,
};
use crate::job::{Job, OutputSpec, OutputValue};
use crate::status::JobStatus;

/// One declared input of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInput {
    /// Input name.
    pub name: String,
    /// Whether the input is fed from a previous step's external output.
    #[serde(default)]
    pub external: bool,
}

/// One step of a chain (also used for wrap-up jobs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step name.
    pub name: String,
    /// Command template to launch.
    pub template: String,
    /// Declared inputs.
    #[serde(default)]
    pub inputs: Vec<StepInput>,
    /// Declared outputs of the launched job.
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
}

impl StepSpec {
    /// A step without inputs or outputs.
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Add an input.
    pub fn with_input(mut self, name: impl Into<String>, external: bool) -> Self {
        self.inputs.push(StepInput {
            name: name.into(),
            external,
        });
        self
    }

    /// Add an output.
    pub fn with_output(mut self, name: impl Into<String>, external: bool) -> Self {
        self.outputs.push(OutputSpec {
            name: name.into(),
            external,
            depends_on: None,
            path: None,
        });
        self
    }
}

/// Where a chain applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationScope {
    /// Site-wide default.
    Site,
    /// One project; overrides the site default.
    Project(String),
}

/// An orchestration chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Orchestration {
    /// Chain id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Scope.
    pub scope: OrchestrationScope,
    /// Disabled chains are never picked for new runs.
    pub enabled: bool,
    /// Stop the chain when a step fails.
    pub halt_on_failure: bool,
    /// Ordered steps.
    pub steps: Vec<StepSpec>,
}

/// Errors while advancing a chain.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum OrchestrationError {
    /// The chain referenced by a workflow does not exist.
    #[error("Orchestration chain {0} not found")]
    ChainNotFound(i64),

    /// An external input of the next step has no matching output.
    #[error("No output bound to input '{input}' of step '{step}'")]
    UnboundInput {
        /// Step name.
        step: String,
        /// Input name.
        input: String,
    },

    /// The chain repository failed.
    #[error("Chain lookup failed: {0}")]
    Chains(CollaboratorError),

    /// The workflow service failed.
    #[error("Workflow service failed: {0}")]
    Workflow(CollaboratorError),

    /// The launcher failed.
    #[error("Launch failed: {0}")]
    Launch(CollaboratorError),
}

impl OrchestrationError {
    /// Short error kind used in workflow details.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChainNotFound(_) => "ChainNotFound",
            Self::UnboundInput { .. } => "InputBinding",
            Self::Chains(_) => "ChainRepository",
            Self::Workflow(_) => "WorkflowService",
            Self::Launch(_) => "Launch",
        }
    }

    /// `<Kind>: <message>`
    pub fn details(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

/// What happened when a step's workflow ended.
#[derive(Debug)]
pub enum ChainAdvance {
    /// The workflow is not part of a chain.
    NotInChain,
    /// The step failed and the chain halts on failure.
    Halted,
    /// The last step ended.
    Finished,
    /// The next step was created and its launch spawned.
    Started {
        /// Workflow of the next step.
        workflow_id: String,
        /// Index of the next step.
        step_index: usize,
        /// Background launch.
        launch: JoinHandle<()>,
    },
    /// The next step could not be started.
    Failed(OrchestrationError),
}

/// Status a workflow is given when its step could not be started.
pub fn orchestration_failure_status() -> JobStatus {
    JobStatus::Failed(Some("Orchestration".to_string()))
}

/// Bind the external outputs of a finished step to the inputs of the next.
///
/// With exactly one external input and one external output the pair is bound
/// positionally whatever the names; otherwise inputs bind by name.
pub fn bind_inputs(
    step: &StepSpec,
    outputs: &[OutputValue],
) -> Result<Vec<BoundInput>, OrchestrationError> {
    let inputs: Vec<&StepInput> = step.inputs.iter().filter(|i| i.external).collect();
    let external: Vec<&OutputValue> = outputs.iter().filter(|o| o.external).collect();

    if let ([input], [output]) = (inputs.as_slice(), external.as_slice()) {
        return Ok(vec![BoundInput {
            name: input.name.clone(),
            value: output.value.clone(),
        }]);
    }

    inputs
        .into_iter()
        .map(|input| {
            external
                .iter()
                .find(|o| o.name == input.name)
                .map(|o| BoundInput {
                    name: input.name.clone(),
                    value: o.value.clone(),
                })
                .ok_or_else(|| OrchestrationError::UnboundInput {
                    step: step.name.clone(),
                    input: input.name.clone(),
                })
        })
        .collect()
}

/// Advances orchestration chains.
#[derive(Clone)]
pub struct OrchestrationController {
    chains: Arc<dyn ChainRepository>,
    workflows: Arc<dyn WorkflowService>,
    launcher: Arc<dyn Launcher>,
    notifier: Arc<dyn Notifier>,
}

impl OrchestrationController {
    /// Create a controller.
    pub fn new(
        chains: Arc<dyn ChainRepository>,
        workflows: Arc<dyn WorkflowService>,
        launcher: Arc<dyn Launcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            chains,
            workflows,
            launcher,
            notifier,
        }
    }

    /// React to the workflow of a chain step reaching a terminal status.
    pub async fn on_workflow_terminal(&self, workflow: &Workflow, job: &Job) -> ChainAdvance {
        let chain_ref = workflow
            .chain_ref
            .zip(workflow.step_index)
            .or_else(|| job.orchestration.as_ref().map(|o| (o.chain_id, o.step_index)));
        let Some((chain_id, step_index)) = chain_ref else {
            return ChainAdvance::NotInChain;
        };

        let chain = match self.chains.get(chain_id).await {
            Ok(Some(chain)) => chain,
            Ok(None) => {
                let err = OrchestrationError::ChainNotFound(chain_id);
                return self.report_unstarted(chain_id, step_index + 1, err);
            }
            Err(e) => {
                let err = OrchestrationError::Chains(e);
                return self.report_unstarted(chain_id, step_index + 1, err);
            }
        };

        if workflow.is_failed() && chain.halt_on_failure {
            info!(
                chain_id,
                step_index,
                workflow_id = %workflow.id,
                "Chain step failed, halting orchestration"
            );
            return ChainAdvance::Halted;
        }

        let next = step_index + 1;
        let Some(step) = chain.steps.get(next).cloned() else {
            info!(chain_id, workflow_id = %workflow.id, "Orchestration chain finished");
            return ChainAdvance::Finished;
        };

        let parent_workflow_id = job
            .orchestration
            .as_ref()
            .and_then(|o| o.parent_workflow_id.clone())
            .or_else(|| workflow.parent_workflow_id.clone());
        let binding = bind_inputs(&step, &job.output_values);

        let request = NewWorkflow {
            chain_ref: Some(chain_id),
            step_index: Some(next),
            project: workflow.project.clone().or_else(|| job.project.clone()),
            parent_workflow_id,
            inputs: binding.clone().unwrap_or_default(),
        };
        self.start_step(chain_id, next, step, request, binding).await
    }

    /// Start the first step of the chain that applies to a project.
    ///
    /// Returns `None` when no enabled chain applies.
    pub async fn start_chain(
        &self,
        project: Option<&str>,
        inputs: Vec<BoundInput>,
        parent_workflow_id: Option<String>,
    ) -> Result<Option<ChainAdvance>, OrchestrationError> {
        let Some(chain) = self
            .chains
            .for_project(project)
            .await
            .map_err(OrchestrationError::Chains)?
        else {
            debug!(project = ?project, "No orchestration chain applies");
            return Ok(None);
        };
        let Some(step) = chain.steps.first().cloned() else {
            return Ok(Some(ChainAdvance::Finished));
        };

        let request = NewWorkflow {
            chain_ref: Some(chain.id),
            step_index: Some(0),
            project: project.map(str::to_string),
            parent_workflow_id,
            inputs: inputs.clone(),
        };
        Ok(Some(self.start_step(chain.id, 0, step, request, Ok(inputs)).await))
    }

    async fn start_step(
        &self,
        chain_id: i64,
        step_index: usize,
        step: StepSpec,
        request: NewWorkflow,
        binding: Result<Vec<BoundInput>, OrchestrationError>,
    ) -> ChainAdvance {
        let workflow = match self.workflows.create(request).await {
            Ok(workflow) => workflow,
            Err(e) => {
                let err = OrchestrationError::Workflow(e);
                return self.report_unstarted(chain_id, step_index, err);
            }
        };

        let inputs = match binding {
            Ok(inputs) => inputs,
            Err(e) => {
                self.fail_workflow(&workflow.id, &e).await;
                return ChainAdvance::Failed(e);
            }
        };

        info!(
            chain_id,
            step_index,
            step = %step.name,
            workflow_id = %workflow.id,
            "Starting orchestration step"
        );

        let workflow_id = workflow.id.clone();
        let controller = self.clone();
        let launch = tokio::spawn(async move {
            let id = workflow.id.clone();
            match controller
                .launcher
                .launch(LaunchRequest::for_step(step, inputs, workflow))
                .await
            {
                Ok(job) => {
                    debug!(workflow_id = %id, job_id = job.id, "Orchestration step launched");
                    let details = Some(format!("Launched job {}", job.id));
                    if let Err(e) = controller
                        .workflows
                        .update_status(&id, JobStatus::Running, details)
                        .await
                    {
                        warn!(workflow_id = %id, error = %e, "Failed to mark workflow running");
                    }
                }
                Err(e) => {
                    controller
                        .fail_workflow(&id, &OrchestrationError::Launch(e))
                        .await;
                }
            }
        });

        ChainAdvance::Started {
            workflow_id,
            step_index,
            launch,
        }
    }

    async fn fail_workflow(&self, workflow_id: &str, err: &OrchestrationError) {
        error!(workflow_id = %workflow_id, error = %err, "Orchestration step failed");
        if let Err(e) = self
            .workflows
            .update_status(workflow_id, orchestration_failure_status(), Some(err.details()))
            .await
        {
            error!(
                workflow_id = %workflow_id,
                error = %e,
                "Failed to record orchestration failure on workflow"
            );
        }
    }

    fn report_unstarted(
        &self,
        chain_id: i64,
        step_index: usize,
        err: OrchestrationError,
    ) -> ChainAdvance {
        error!(chain_id, step_index, error = %err, "Could not start orchestration step");
        self.notifier.trigger_event(EngineEvent::OrchestrationFailed {
            chain_id,
            step_index,
            error: err.details(),
        });
        ChainAdvance::Failed(err)
    }
}
