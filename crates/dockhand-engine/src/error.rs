// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the engine.

use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Job store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] crate::persistence::StoreError),

    /// Backend call failed.
    #[error("Backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),

    /// Collaborator call failed.
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] crate::collaborators::CollaboratorError),

    /// An event could not be dispatched.
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    /// Job was not found.
    #[error("Job not found: {0}")]
    JobNotFound(i64),

    /// No adapter is registered for a backend kind.
    #[error("No adapter registered for {0} backend")]
    NoAdapter(crate::backend::BackendKind),

    /// The job cannot take the requested action in its current state.
    #[error("Invalid job state: {0}")]
    InvalidState(String),
}

/// Result type using the engine Error.
pub type Result<T> = std::result::Result<T, Error>;
