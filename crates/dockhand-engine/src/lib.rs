// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dockhand Engine - Container Job Status Reconciliation
//!
//! This crate keeps the recorded status of containerized jobs consistent with
//! what the container backends report, and drives every job that has exited
//! through finalization exactly once. Finalized jobs advance the
//! orchestration chain they belong to.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!   │ plain engine │   │    swarm     │   │   cluster    │
//!   │ (event poll) │   │ (task poll)  │   │ (pod watch)  │
//!   └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!          │   BackendAdapter │                  │ push
//!          ▼                  ▼                  │
//!   ┌─────────────────────────────────┐          │
//!   │       Reconciler (ticks)        │          │
//!   └───────────────┬─────────────────┘          │
//!                   │ JobEvent                   │
//!                   ▼                            ▼
//!   ┌──────────────────────────────────────────────────┐
//!   │     EventDispatcher (per-job single flight)      │──► JobStore
//!   └───────────────────────┬──────────────────────────┘
//!                           │ exit
//!                           ▼
//!   ┌──────────────────────────────────────────────────┐
//!   │  FinalizationCoordinator (claim, outputs,        │──► OutputHandler
//!   │  wrap-ups, final status, workflow update)        │──► Launcher
//!   └───────────────────────┬──────────────────────────┘──► WorkflowService
//!                           │ workflow terminal
//!                           ▼
//!   ┌──────────────────────────────────────────────────┐
//!   │   OrchestrationController (next chain step)      │──► ChainRepository
//!   └──────────────────────────────────────────────────┘
//! ```
//!
//! # Job Status State Machine
//!
//! ```text
//!   Created ──► Running ──┬──► Waiting (..) ──┐
//!                         │                   ├──► Finalizing ──┬──► Complete
//!                         ├──► Failed (..) ───┤                 └──► Failed (reason)
//!                         └──► Killed ────────┘
//! ```
//!
//! A job's status only follows history entries newer than the current one,
//! and once terminal only finalization moves it.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DOCKHAND_DATABASE_URL` | required | Job store database URL |
//! | `DOCKHAND_RECONCILE_INTERVAL_SECS` | 10 | Time between ticks |
//! | `DOCKHAND_BACKEND_TIMEOUT_SECS` | 30 | Timeout for every backend call |
//! | `DOCKHAND_FINALIZE_POOL_SIZE` | 4 | Concurrent finalizations |
//! | `DOCKHAND_WAITING_TIMEOUT_SECS` | 300 | Max time in `Waiting` without confirmation |
//!
//! # Modules
//!
//! - [`runtime`]: Embeddable runtime wiring everything together
//! - [`reconciler`]: Fixed-interval reconciliation loop
//! - [`dispatcher`]: Event dispatch with per-job single flight
//! - [`finalizer`]: Exactly-once finalization
//! - [`orchestration`]: Orchestration chains
//! - [`backend`]: Backend adapters
//! - [`persistence`]: Job store

#![deny(missing_docs)]

/// Backend adapters for the plain engine, swarm and cluster backends.
pub mod backend;

/// Interfaces to the surrounding system (launcher, workflows, notifications).
pub mod collaborators;

/// Configuration loaded from environment variables.
pub mod config;

/// Operator job control.
pub mod control;

/// Event dispatcher.
pub mod dispatcher;

/// Error types.
pub mod error;

/// Finalization coordinator.
pub mod finalizer;

/// Job aggregate and status history.
pub mod job;

/// Orchestration chains.
pub mod orchestration;

/// Output dependency ordering.
pub mod outputs;

/// Job persistence.
pub mod persistence;

/// Reconciliation loop.
pub mod reconciler;

/// Embeddable runtime.
pub mod runtime;

/// Per-key in-flight guards.
pub mod single_flight;

/// Canonical job statuses and normalization.
pub mod status;

pub use error::{Error, Result};
pub use job::{HistoryEntry, Job};
pub use runtime::EngineRuntime;
pub use status::JobStatus;
