// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for orchestration chains driven by finalization.

mod common;

use std::time::Duration;

use common::{TestEngine, init_tracing};
use dockhand_engine::collaborators::{
    BoundInput, EngineEvent, NewWorkflow, Workflow, WorkflowService,
};
use dockhand_engine::job::Job;
use dockhand_engine::orchestration::{
    ChainAdvance, Orchestration, OrchestrationScope, StepSpec, orchestration_failure_status,
};
use dockhand_engine::persistence::JobStore;
use dockhand_engine::status::JobStatus;

fn chain(id: i64, scope: OrchestrationScope, halt_on_failure: bool) -> Orchestration {
    Orchestration {
        id,
        name: format!("chain-{}", id),
        scope,
        enabled: true,
        halt_on_failure,
        steps: vec![
            StepSpec::new("extract", "extract").with_output("dataset", true),
            StepSpec::new("transform", "transform")
                .with_input("raw", true)
                .with_output("table", true),
            StepSpec::new("load", "load").with_input("table", true),
        ],
    }
}

/// Wait until the workflow of a chain step has the given status.
async fn wait_step(engine: &TestEngine, step_index: usize, status: &JobStatus) -> Workflow {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let found = engine
            .workflows
            .all()
            .await
            .into_iter()
            .find(|w| w.step_index == Some(step_index) && &w.status == status);
        if let Some(workflow) = found {
            return workflow;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "step {} never reached {}",
            step_index,
            status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// The job launched for a workflow.
async fn job_for(engine: &TestEngine, workflow: &Workflow) -> Job {
    engine
        .store
        .list_non_terminal(None)
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.workflow_id.as_deref() == Some(workflow.id.as_str()))
        .expect("no job for workflow")
}

async fn start(engine: &TestEngine, project: Option<&str>) -> Workflow {
    let advance = engine
        .orchestration
        .start_chain(project, Vec::new(), None)
        .await
        .unwrap()
        .expect("no chain applies");
    match advance {
        ChainAdvance::Started { launch, .. } => launch.await.unwrap(),
        other => panic!("chain not started: {:?}", other),
    }
    wait_step(engine, 0, &JobStatus::Running).await
}

#[tokio::test]
async fn test_three_step_chain_runs_to_completion() {
    init_tracing();
    let engine = TestEngine::new();
    engine
        .chains
        .insert(chain(1, OrchestrationScope::Site, true))
        .await;

    let first = start(&engine, None).await;
    let job = job_for(&engine, &first).await;
    engine.finalizer.finalize(job.id, Some(0), true).await;

    let second = wait_step(&engine, 1, &JobStatus::Running).await;
    assert_eq!(second.chain_ref, Some(1));
    assert_eq!(
        second.inputs,
        vec![BoundInput {
            name: "raw".into(),
            value: "extract-1/dataset".into()
        }]
    );
    let job = job_for(&engine, &second).await;
    assert_eq!(job.orchestration.as_ref().map(|o| o.step_index), Some(1));
    engine.finalizer.finalize(job.id, Some(0), true).await;

    let third = wait_step(&engine, 2, &JobStatus::Running).await;
    assert_eq!(third.inputs[0].value, "transform-2/table");
    let job = job_for(&engine, &third).await;
    engine.finalizer.finalize(job.id, Some(0), true).await;

    let workflows = engine.workflows.all().await;
    assert_eq!(workflows.len(), 3);
    assert!(workflows.iter().all(|w| w.status == JobStatus::Complete));
    assert_eq!(engine.launcher.requests().await.len(), 3);
}

#[tokio::test]
async fn test_failed_step_halts_chain() {
    let engine = TestEngine::new();
    engine
        .chains
        .insert(chain(1, OrchestrationScope::Site, true))
        .await;

    let first = start(&engine, None).await;
    let job = job_for(&engine, &first).await;
    engine.finalizer.finalize(job.id, Some(1), false).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.workflows.all().await.len(), 1);
    assert_eq!(engine.launcher.requests().await.len(), 1);
}

#[tokio::test]
async fn test_failed_step_continues_without_halt() {
    let engine = TestEngine::new();
    engine
        .chains
        .insert(chain(1, OrchestrationScope::Site, false))
        .await;

    let first = start(&engine, None).await;
    let job = job_for(&engine, &first).await;
    engine.finalizer.finalize(job.id, Some(1), false).await;

    let second = wait_step(&engine, 1, &JobStatus::Running).await;
    assert_eq!(second.inputs[0].value, "extract-1/dataset");
}

#[tokio::test]
async fn test_launch_failure_marks_workflow_failed() {
    let engine = TestEngine::new();
    engine
        .chains
        .insert(chain(1, OrchestrationScope::Site, true))
        .await;
    engine.launcher.reject_template("transform").await;

    let first = start(&engine, None).await;
    let job = job_for(&engine, &first).await;
    engine.finalizer.finalize(job.id, Some(0), true).await;

    let second = wait_step(&engine, 1, &orchestration_failure_status()).await;
    assert_eq!(second.status.to_string(), "Failed (Orchestration)");
    assert!(
        second
            .details
            .as_deref()
            .is_some_and(|d| d.starts_with("Launch: "))
    );
}

#[tokio::test]
async fn test_unbound_input_marks_workflow_failed() {
    let engine = TestEngine::new();
    let mut orchestration = chain(1, OrchestrationScope::Site, true);
    orchestration.steps[1] = StepSpec::new("join", "join")
        .with_input("left", true)
        .with_input("right", true);
    engine.chains.insert(orchestration).await;

    let first = start(&engine, None).await;
    let job = job_for(&engine, &first).await;
    engine.finalizer.finalize(job.id, Some(0), true).await;

    let second = wait_step(&engine, 1, &orchestration_failure_status()).await;
    assert!(
        second
            .details
            .as_deref()
            .is_some_and(|d| d.starts_with("InputBinding: "))
    );
    assert_eq!(engine.launcher.requests().await.len(), 1);
}

#[tokio::test]
async fn test_project_chain_overrides_site_default() {
    let engine = TestEngine::new();
    engine
        .chains
        .insert(chain(1, OrchestrationScope::Site, true))
        .await;
    engine
        .chains
        .insert(chain(2, OrchestrationScope::Project("acme".into()), true))
        .await;

    let acme = start(&engine, Some("acme")).await;
    assert_eq!(acme.chain_ref, Some(2));
    assert_eq!(acme.project.as_deref(), Some("acme"));

    let other = engine
        .orchestration
        .start_chain(Some("globex"), Vec::new(), None)
        .await
        .unwrap();
    match other {
        Some(ChainAdvance::Started { workflow_id, .. }) => {
            let workflow = engine.workflows.get(&workflow_id).await.unwrap().unwrap();
            assert_eq!(workflow.chain_ref, Some(1));
        }
        other => panic!("site chain not started: {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_chain_is_reported() {
    let engine = TestEngine::new();
    let workflow = engine
        .workflows
        .create(NewWorkflow {
            chain_ref: Some(99),
            step_index: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();
    let job = engine
        .register(common::swarm_job("svc-1").with_workflow(workflow.id.clone()))
        .await;

    engine.finalizer.finalize(job.id, Some(0), true).await;

    let reported = engine.notifier.events().into_iter().any(|e| {
        matches!(
            e,
            EngineEvent::OrchestrationFailed { chain_id: 99, step_index: 1, .. }
        )
    });
    assert!(reported);
}
