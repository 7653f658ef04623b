// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for dockhand-engine integration tests.
//!
//! Provides TestEngine, wiring the engine over an in-memory job store,
//! in-memory collaborators and one mock backend per kind.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dockhand_engine::backend::{AdapterRegistry, BackendAdapter, BackendKind, MockBackend};
use dockhand_engine::collaborators::memory::{
    MemoryChains, MemoryLauncher, MemoryWorkflows, RecordingNotifier, StaticOutputHandler,
};
use dockhand_engine::control::JobControl;
use dockhand_engine::dispatcher::{DispatcherConfig, EventDispatcher};
use dockhand_engine::finalizer::{FinalizationCoordinator, FinalizerConfig};
use dockhand_engine::job::{FinalizationState, Job};
use dockhand_engine::orchestration::OrchestrationController;
use dockhand_engine::persistence::{JobStore, MemoryJobStore};
use dockhand_engine::reconciler::{Reconciler, ReconcilerConfig};

/// Engine wired for tests.
pub struct TestEngine {
    pub store: Arc<MemoryJobStore>,
    pub plain: Arc<MockBackend>,
    pub swarm: Arc<MockBackend>,
    pub cluster: Arc<MockBackend>,
    pub launcher: Arc<MemoryLauncher>,
    pub workflows: Arc<MemoryWorkflows>,
    pub outputs: Arc<StaticOutputHandler>,
    pub notifier: Arc<RecordingNotifier>,
    pub chains: Arc<MemoryChains>,
    pub orchestration: OrchestrationController,
    pub finalizer: FinalizationCoordinator,
    pub dispatcher: EventDispatcher,
    pub reconciler: Reconciler,
    pub control: JobControl,
}

/// Knobs for [`TestEngine::with_options`].
pub struct TestOptions {
    /// Backend kind of jobs created by the launcher.
    pub launch_kind: BackendKind,
    /// Dispatcher settings.
    pub dispatcher: DispatcherConfig,
    /// Delay of swarm `describe` calls.
    pub swarm_describe_delay_ms: u64,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            launch_kind: BackendKind::Swarm,
            dispatcher: DispatcherConfig::default(),
            swarm_describe_delay_ms: 0,
        }
    }
}

impl TestEngine {
    /// Engine whose launcher creates swarm jobs.
    pub fn new() -> Self {
        Self::with_options(TestOptions::default())
    }

    /// Engine with custom options.
    pub fn with_options(options: TestOptions) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let plain = Arc::new(MockBackend::new(BackendKind::Plain));
        let mut swarm = MockBackend::new(BackendKind::Swarm);
        swarm.describe_delay_ms = options.swarm_describe_delay_ms;
        let swarm = Arc::new(swarm);
        let cluster = Arc::new(MockBackend::with_push(BackendKind::Cluster));

        let mut adapters = AdapterRegistry::new();
        adapters.register(plain.clone() as Arc<dyn BackendAdapter>);
        adapters.register(swarm.clone() as Arc<dyn BackendAdapter>);
        adapters.register(cluster.clone() as Arc<dyn BackendAdapter>);

        let launcher = Arc::new(MemoryLauncher::new(store.clone(), options.launch_kind));
        let workflows = Arc::new(MemoryWorkflows::new());
        let outputs = Arc::new(StaticOutputHandler::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let chains = Arc::new(MemoryChains::new());

        let orchestration = OrchestrationController::new(
            chains.clone(),
            workflows.clone(),
            launcher.clone(),
            notifier.clone(),
        );
        let finalizer = FinalizationCoordinator::new(
            store.clone(),
            launcher.clone(),
            workflows.clone(),
            outputs.clone(),
            notifier.clone(),
            orchestration.clone(),
            FinalizerConfig::default(),
        );
        let dispatcher = EventDispatcher::new(
            store.clone(),
            adapters.clone(),
            finalizer.clone(),
            notifier.clone(),
            options.dispatcher,
        );
        let reconciler = Reconciler::new(
            store.clone(),
            adapters.clone(),
            dispatcher.clone(),
            workflows.clone(),
            ReconcilerConfig {
                interval: Duration::from_millis(50),
                backend_timeout: Duration::from_secs(5),
            },
        );
        let control = JobControl::new(
            store.clone(),
            adapters,
            notifier.clone(),
            Duration::from_secs(5),
        );

        Self {
            store,
            plain,
            swarm,
            cluster,
            launcher,
            workflows,
            outputs,
            notifier,
            chains,
            orchestration,
            finalizer,
            dispatcher,
            reconciler,
            control,
        }
    }

    /// Register a job with the store.
    pub async fn register(&self, job: Job) -> Job {
        self.control
            .register_launched(job)
            .await
            .expect("Failed to register job")
    }

    /// Load a job that must exist.
    pub async fn job(&self, id: i64) -> Job {
        self.store
            .get(id)
            .await
            .expect("Store failed")
            .expect("Job missing")
    }

    /// Another coordinator over the same store and collaborators, as a second
    /// engine process would have.
    pub fn second_finalizer(&self) -> FinalizationCoordinator {
        FinalizationCoordinator::new(
            self.store.clone(),
            self.launcher.clone(),
            self.workflows.clone(),
            self.outputs.clone(),
            self.notifier.clone(),
            self.orchestration.clone(),
            FinalizerConfig::default(),
        )
    }

    /// Wait until a job is finalized.
    pub async fn wait_finalized(&self, id: i64) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = self.job(id).await;
            if job.finalization == FinalizationState::Finalized {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} not finalized in time (status {})",
                id,
                job.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until the store holds `count` jobs.
    pub async fn wait_jobs(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.store.len().await < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {} jobs",
                count
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// A swarm job for service `service_id`.
pub fn swarm_job(service_id: &str) -> Job {
    Job::new(BackendKind::Swarm).with_service(service_id, None)
}

/// A plain-engine job for container `container_id`.
pub fn plain_job(container_id: &str) -> Job {
    Job::new(BackendKind::Plain).with_container_id(container_id)
}

/// Initialize test logging once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
