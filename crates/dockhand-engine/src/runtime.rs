// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the engine.
//!
//! [`EngineRuntime`] wires the store, the backend adapters and the
//! collaborators together and runs the background tasks inside an existing
//! tokio application:
//! - the reconciliation loop
//! - one push listener per adapter that offers a push stream
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dockhand_engine::backend::PlainAdapter;
//! use dockhand_engine::config::Config;
//! use dockhand_engine::persistence::SqliteJobStore;
//! use dockhand_engine::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = Arc::new(SqliteJobStore::connect(&config.database_url).await?);
//!
//!     let runtime = EngineRuntime::builder()
//!         .config(&config)
//!         .store(store)
//!         .adapter(Arc::new(PlainAdapter::new(engine_client)))
//!         .launcher(launcher)
//!         .workflows(workflows)
//!         .outputs(outputs)
//!         .notifier(notifier)
//!         .chains(chains)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{AdapterRegistry, BackendAdapter, BackendEvent, BackendKind};
use crate::collaborators::{ChainRepository, Launcher, Notifier, OutputHandler, WorkflowService};
use crate::config::Config;
use crate::control::JobControl;
use crate::dispatcher::{DispatcherConfig, EventDispatcher, JobEvent};
use crate::finalizer::{FinalizationCoordinator, FinalizerConfig};
use crate::orchestration::OrchestrationController;
use crate::persistence::JobStore;
use crate::reconciler::{Reconciler, ReconcilerConfig};

/// Builder for creating an [`EngineRuntime`].
#[derive(Default)]
pub struct EngineRuntimeBuilder {
    store: Option<Arc<dyn JobStore>>,
    adapters: AdapterRegistry,
    launcher: Option<Arc<dyn Launcher>>,
    workflows: Option<Arc<dyn WorkflowService>>,
    outputs: Option<Arc<dyn OutputHandler>>,
    notifier: Option<Arc<dyn Notifier>>,
    chains: Option<Arc<dyn ChainRepository>>,
    reconciler: ReconcilerConfig,
    dispatcher: DispatcherConfig,
    finalizer: FinalizerConfig,
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take intervals, timeouts and pool size from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.reconciler = config.reconciler();
        self.dispatcher = config.dispatcher();
        self.finalizer = config.finalizer();
        self
    }

    /// Set the job store (required).
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a backend adapter. At least one is required.
    pub fn adapter(mut self, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.adapters.register(adapter);
        self
    }

    /// Set the job launcher (required).
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Set the workflow service (required).
    pub fn workflows(mut self, workflows: Arc<dyn WorkflowService>) -> Self {
        self.workflows = Some(workflows);
        self
    }

    /// Set the output handler (required).
    pub fn outputs(mut self, outputs: Arc<dyn OutputHandler>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    /// Set the notifier (required).
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set the orchestration chain repository (required).
    pub fn chains(mut self, chains: Arc<dyn ChainRepository>) -> Self {
        self.chains = Some(chains);
        self
    }

    /// Set the reconciliation interval.
    ///
    /// Default: 10 seconds
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconciler.interval = interval;
        self
    }

    /// Set the timeout for backend calls.
    ///
    /// Default: 30 seconds
    pub fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.reconciler.backend_timeout = timeout;
        self.dispatcher.backend_timeout = timeout;
        self
    }

    /// Set how long a job may wait for service-level confirmation.
    ///
    /// Default: 5 minutes
    pub fn waiting_timeout(mut self, timeout: Duration) -> Self {
        self.dispatcher.waiting_timeout = timeout;
        self
    }

    /// Set the number of concurrent finalizations.
    ///
    /// Default: 4
    pub fn finalize_pool_size(mut self, size: usize) -> Self {
        self.finalizer.pool_size = size;
        self
    }

    /// Build the runtime components.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let launcher = self
            .launcher
            .ok_or_else(|| anyhow::anyhow!("launcher is required"))?;
        let workflows = self
            .workflows
            .ok_or_else(|| anyhow::anyhow!("workflows is required"))?;
        let outputs = self
            .outputs
            .ok_or_else(|| anyhow::anyhow!("outputs is required"))?;
        let notifier = self
            .notifier
            .ok_or_else(|| anyhow::anyhow!("notifier is required"))?;
        let chains = self
            .chains
            .ok_or_else(|| anyhow::anyhow!("chains is required"))?;
        if self.adapters.is_empty() {
            anyhow::bail!("at least one backend adapter is required");
        }

        let orchestration = OrchestrationController::new(
            chains,
            workflows.clone(),
            launcher.clone(),
            notifier.clone(),
        );
        let finalizer = FinalizationCoordinator::new(
            store.clone(),
            launcher,
            workflows.clone(),
            outputs,
            notifier.clone(),
            orchestration.clone(),
            self.finalizer,
        );
        let dispatcher = EventDispatcher::new(
            store.clone(),
            self.adapters.clone(),
            finalizer.clone(),
            notifier.clone(),
            self.dispatcher,
        );
        let control = JobControl::new(
            store.clone(),
            self.adapters.clone(),
            notifier,
            self.reconciler.backend_timeout,
        );
        let reconciler = Reconciler::new(
            store,
            self.adapters.clone(),
            dispatcher.clone(),
            workflows,
            self.reconciler,
        );

        Ok(EngineRuntimeConfig {
            adapters: self.adapters,
            reconciler,
            dispatcher,
            finalizer,
            orchestration,
            control,
        })
    }
}

/// Built, not yet started [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    adapters: AdapterRegistry,
    reconciler: Reconciler,
    dispatcher: EventDispatcher,
    finalizer: FinalizationCoordinator,
    orchestration: OrchestrationController,
    control: JobControl,
}

impl EngineRuntimeConfig {
    /// The reconciler, for driving ticks by hand before starting.
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Start the runtime, spawning the reconciliation loop and push listeners.
    pub async fn start(self) -> Result<EngineRuntime> {
        let reconciler = Arc::new(self.reconciler);
        let reconciler_shutdown = reconciler.shutdown_handle();
        let ready = reconciler.ready_flag();

        let reconciler_handle = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move {
                reconciler.run().await;
            })
        };

        let mut listeners = Vec::new();
        for adapter in self.adapters.iter() {
            let Some(rx) = adapter.subscribe() else {
                continue;
            };
            let shutdown = Arc::new(Notify::new());
            let handle = tokio::spawn(listen(
                adapter.kind(),
                rx,
                self.dispatcher.clone(),
                shutdown.clone(),
            ));
            listeners.push(Listener { shutdown, handle });
        }

        info!(
            backends = self.adapters.len(),
            push_listeners = listeners.len(),
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            reconciler_handle,
            reconciler_shutdown,
            listeners,
            ready,
            dispatcher: self.dispatcher,
            finalizer: self.finalizer,
            orchestration: self.orchestration,
            control: self.control,
        })
    }
}

struct Listener {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// A running engine that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination. Finalizations
/// already submitted keep running on the tokio runtime.
pub struct EngineRuntime {
    reconciler_handle: JoinHandle<()>,
    reconciler_shutdown: Arc<Notify>,
    listeners: Vec<Listener>,
    ready: Arc<std::sync::atomic::AtomicBool>,
    dispatcher: EventDispatcher,
    finalizer: FinalizationCoordinator,
    orchestration: OrchestrationController,
    control: JobControl,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// The event dispatcher, for feeding events from outside.
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// The finalization coordinator.
    pub fn finalizer(&self) -> &FinalizationCoordinator {
        &self.finalizer
    }

    /// The orchestration controller, for starting chains.
    pub fn orchestration(&self) -> &OrchestrationController {
        &self.orchestration
    }

    /// Job control (register, kill).
    pub fn control(&self) -> &JobControl {
        &self.control
    }

    /// Mark the host application (not) ready. Ticks are skipped while not ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the reconciliation loop and the push listeners to stop, then
    /// waits for them to complete.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        self.reconciler_shutdown.notify_one();
        for listener in &self.listeners {
            listener.shutdown.notify_one();
        }

        let mut panicked = false;
        if let Err(e) = self.reconciler_handle.await {
            error!("Reconciler task panicked: {}", e);
            panicked = true;
        }
        for listener in self.listeners {
            if let Err(e) = listener.handle.await {
                error!("Push listener task panicked: {}", e);
                panicked = true;
            }
        }

        if panicked {
            anyhow::bail!("background task panicked");
        }
        info!("EngineRuntime shutdown complete");
        Ok(())
    }

    /// Check if the background tasks are still running.
    pub fn is_running(&self) -> bool {
        !self.reconciler_handle.is_finished()
            && self.listeners.iter().all(|l| !l.handle.is_finished())
    }
}

/// Dispatch pushed events until shutdown or until the stream closes.
async fn listen(
    kind: BackendKind,
    mut rx: broadcast::Receiver<BackendEvent>,
    dispatcher: EventDispatcher,
    shutdown: Arc<Notify>,
) {
    info!(backend = %kind, "Push listener started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => {
                debug!(backend = %kind, "Push listener received shutdown signal");
                break;
            }

            received = rx.recv() => match received {
                Ok(event) => {
                    dispatcher.dispatch(JobEvent::Container(event)).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(backend = %kind, skipped, "Push listener lagged, reconciliation will catch up");
                }
                Err(RecvError::Closed) => {
                    warn!(backend = %kind, "Push stream closed");
                    break;
                }
            }
        }
    }

    info!(backend = %kind, "Push listener stopped");
}
