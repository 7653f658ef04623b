// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the reconciliation loop.

mod common;

use std::collections::HashMap;

use common::{TestEngine, init_tracing, plain_job, swarm_job};
use dockhand_engine::backend::{BackendError, BackendEvent, BackendKind, JobRef};
use dockhand_engine::collaborators::{Workflow, WorkflowService};
use dockhand_engine::dispatcher::JobEvent;
use dockhand_engine::job::{EntryOrigin, FinalizationState};
use dockhand_engine::persistence::JobStore;
use dockhand_engine::reconciler::TickOutcome;
use dockhand_engine::status::JobStatus;

fn swarm_event(service_id: &str, raw: &str) -> BackendEvent {
    BackendEvent::new(
        JobRef::new(BackendKind::Swarm, service_id),
        raw,
        HashMap::new(),
    )
}

#[tokio::test]
async fn test_plain_events_are_dispatched_and_watermark_advanced() {
    init_tracing();
    let engine = TestEngine::new();
    let job = engine.register(plain_job("c1")).await;

    engine
        .plain
        .queue_event(BackendEvent::new(
            JobRef::new(BackendKind::Plain, "c1"),
            "start",
            HashMap::new(),
        ))
        .await;

    let report = engine.reconciler.tick().await;
    assert_eq!(report.outcome(), TickOutcome::AllSucceeded);
    assert_eq!(engine.job(job.id).await.status, JobStatus::Running);
    assert!(
        engine
            .store
            .last_event_check(BackendKind::Plain)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_failed_event_read_keeps_watermark() {
    let engine = TestEngine::new();
    engine
        .plain
        .set_events_error(Some(BackendError::Malformed("truncated stream".into())))
        .await;

    let report = engine.reconciler.tick().await;
    assert_eq!(report.outcome(), TickOutcome::AllFailed);
    assert!(
        engine
            .store
            .last_event_check(BackendKind::Plain)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_active_swarm_job_gets_task_snapshot() {
    let engine = TestEngine::new();
    let job = engine.register(swarm_job("svc-1")).await;
    engine
        .swarm
        .set_describe("svc-1", Ok(swarm_event("svc-1", "running")))
        .await;

    let report = engine.reconciler.tick().await;
    assert_eq!(report.outcome(), TickOutcome::AllSucceeded);

    let job = engine.job(job.id).await;
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(
        job.history.latest().map(|e| e.origin),
        Some(EntryOrigin::TaskSnapshot)
    );
}

#[tokio::test]
async fn test_vanished_swarm_job_is_finalized_as_node_error() {
    let engine = TestEngine::new();
    let job = engine.register(swarm_job("svc-1")).await;

    engine.reconciler.tick().await;
    engine.reconciler.tick().await;
    let job = engine.wait_finalized(job.id).await;
    engine.reconciler.tick().await;

    let job_after = engine.job(job.id).await;
    assert_eq!(job_after.status, JobStatus::Failed(Some("Swarm node error".into())));
    let lost: Vec<_> = job_after
        .history
        .iter()
        .filter(|e| e.message.as_deref() == Some("Backend lost the job while Created"))
        .collect();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].status, JobStatus::Failed(Some("Swarm node error".into())));
    assert_eq!(job_after.history.len(), job.history.len());
}

#[tokio::test]
async fn test_killed_swarm_job_is_finalized() {
    let engine = TestEngine::new();
    let workflow = engine.workflows.create(Default::default()).await.unwrap();
    let job = engine
        .register(swarm_job("svc-1").with_workflow(workflow.id.clone()))
        .await;

    engine.control.kill(job.id, "alice").await.unwrap();
    assert_eq!(engine.swarm.killed().await.len(), 1);
    assert_eq!(engine.job(job.id).await.status, JobStatus::Killed);

    // The service is removed, so the next tick confirms the exit.
    engine.reconciler.tick().await;

    let job = engine.wait_finalized(job.id).await;
    assert_eq!(job.status, JobStatus::Failed(Some("Killed".into())));
    assert!(
        job.history
            .iter()
            .any(|e| e.origin == EntryOrigin::UserAction && e.status == JobStatus::Killed)
    );
    let workflow = engine.workflows.get(&workflow.id).await.unwrap().unwrap();
    assert!(workflow.is_failed());
}

#[tokio::test]
async fn test_failed_task_finalized_after_service_exit() {
    let engine = TestEngine::new();
    let job = engine.register(swarm_job("svc-1")).await;
    engine
        .swarm
        .set_describe("svc-1", Ok(swarm_event("svc-1", "failed")))
        .await;

    // The task failed but the service is still up.
    engine.reconciler.tick().await;
    engine.reconciler.tick().await;
    let job_now = engine.job(job.id).await;
    assert_eq!(job_now.status, JobStatus::Failed(None));
    assert_eq!(job_now.finalization, FinalizationState::Pending);

    engine
        .swarm
        .set_describe(
            "svc-1",
            Ok(swarm_event("svc-1", "failed")
                .with_exit_code(Some(1))
                .exit(true)),
        )
        .await;
    engine.reconciler.tick().await;

    let job = engine.wait_finalized(job.id).await;
    assert_eq!(job.status, JobStatus::Failed(Some("Exit code 1".into())));
}

#[tokio::test]
async fn test_task_lookup_failure_marks_lost_task() {
    let engine = TestEngine::new();
    let job = engine.register(swarm_job("svc-1")).await;
    engine
        .swarm
        .set_describe(
            "svc-1",
            Err(BackendError::LookupFailed {
                job: "svc-1".into(),
                reason: "task t-1 not listed".into(),
            }),
        )
        .await;

    engine.reconciler.tick().await;

    let job = engine.wait_finalized(job.id).await;
    assert_eq!(job.status, JobStatus::Failed(Some("Lost task".into())));
}

#[tokio::test]
async fn test_failures_are_isolated_per_job() {
    let engine = TestEngine::new();
    let broken = engine.register(swarm_job("svc-1")).await;
    let healthy = engine.register(swarm_job("svc-2")).await;
    engine
        .swarm
        .set_describe("svc-1", Err(BackendError::Malformed("no tasks array".into())))
        .await;
    engine
        .swarm
        .set_describe("svc-2", Ok(swarm_event("svc-2", "running")))
        .await;

    let report = engine.reconciler.tick().await;
    assert_eq!(report.outcome(), TickOutcome::Mixed);

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].job_id, Some(broken.id));

    assert_eq!(engine.job(broken.id).await.status, JobStatus::Created);
    assert_eq!(engine.job(healthy.id).await.status, JobStatus::Running);
}

#[tokio::test]
async fn test_unreachable_backend_is_skipped() {
    let engine = TestEngine::new();
    let job = engine.register(swarm_job("svc-1")).await;
    engine
        .swarm
        .set_ping_error(Some(BackendError::Unavailable("connection refused".into())))
        .await;

    let report = engine.reconciler.tick().await;
    assert_eq!(report.outcome(), TickOutcome::AllFailed);
    assert_eq!(engine.swarm.describe_calls(), 0);
    assert_eq!(engine.job(job.id).await.status, JobStatus::Created);

    engine.swarm.set_ping_error(None).await;
    engine
        .swarm
        .set_describe("svc-1", Ok(swarm_event("svc-1", "running")))
        .await;
    let report = engine.reconciler.tick().await;
    assert_eq!(report.outcome(), TickOutcome::AllSucceeded);
    assert_eq!(engine.job(job.id).await.status, JobStatus::Running);
}

#[tokio::test]
async fn test_tick_skipped_until_ready() {
    let engine = TestEngine::new();
    engine.register(swarm_job("svc-1")).await;
    engine.reconciler.set_ready(false);

    let report = engine.reconciler.tick().await;
    assert!(report.skipped);
    assert_eq!(engine.swarm.describe_calls(), 0);

    engine.reconciler.set_ready(true);
    let report = engine.reconciler.tick().await;
    assert!(!report.skipped);
    assert_eq!(engine.swarm.describe_calls(), 1);
}

#[tokio::test]
async fn test_job_aligned_with_terminal_workflow() {
    let engine = TestEngine::new();
    let workflow = engine
        .workflows
        .create(Default::default())
        .await
        .unwrap();
    engine
        .workflows
        .update_status(&workflow.id, JobStatus::Killed, None)
        .await
        .unwrap();
    let job = engine
        .register(swarm_job("svc-1").with_workflow(workflow.id.clone()))
        .await;

    let report = engine.reconciler.tick().await;
    assert_eq!(report.outcome(), TickOutcome::AllSucceeded);
    assert_eq!(engine.swarm.describe_calls(), 0);

    let job = engine.job(job.id).await;
    assert_eq!(job.status, JobStatus::Killed);
    assert_eq!(job.finalization, FinalizationState::Finalized);
    assert_eq!(
        job.history.latest().and_then(|e| e.message.clone()).as_deref(),
        Some("Aligned with workflow status Killed")
    );

    // Nothing left to do on later ticks.
    engine.reconciler.tick().await;
    assert_eq!(engine.job(job.id).await.history.len(), job.history.len());
    assert_eq!(engine.swarm.describe_calls(), 0);
}

#[tokio::test]
async fn test_waiting_job_routed_to_confirmation_check() {
    let engine = TestEngine::new();
    let workflow: Workflow = engine
        .workflows
        .create(Default::default())
        .await
        .unwrap();
    let job = engine
        .register(swarm_job("svc-1").with_workflow(workflow.id.clone()))
        .await;
    engine
        .dispatcher
        .dispatch(JobEvent::Task {
            job_id: job.id,
            event: swarm_event("svc-1", "complete").with_exit_code(Some(0)),
        })
        .await;

    // The service is gone by the next tick.
    engine.reconciler.tick().await;

    let job = engine.wait_finalized(job.id).await;
    assert_eq!(job.status, JobStatus::Complete);

    let workflow = engine.workflows.get(&workflow.id).await.unwrap().unwrap();
    assert_eq!(workflow.status, JobStatus::Complete);
}

#[tokio::test]
async fn test_untracked_backend_jobs_do_not_fail_tick() {
    let engine = TestEngine::new();
    engine
        .cluster
        .set_active(vec![JobRef::new(BackendKind::Cluster, "ghost-job")])
        .await;

    let report = engine.reconciler.tick().await;
    assert_eq!(report.outcome(), TickOutcome::AllSucceeded);
    assert!(
        engine
            .store
            .get_by_native_id(BackendKind::Cluster, "ghost-job")
            .await
            .unwrap()
            .is_none()
    );
}
