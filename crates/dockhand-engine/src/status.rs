// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Canonical job status and backend status normalization.
//!
//! Every backend speaks its own status vocabulary (Docker events, Swarm task
//! states, Kubernetes pod phases). [`normalize`] is the only place where those
//! raw tokens are interpreted; the rest of the engine works on [`JobStatus`].
//!
//! # Lifecycle
//!
//! ```text
//!  Created ──► Running ──┬──► Waiting ───────┐
//!                        ├──► Failed         │
//!                        ├──► Killed         ├──► Finalizing ──┬──► Complete
//!                        └──► Complete ──────┘                 └──► Failed
//! ```
//!
//! `Waiting` means the single-container exit signal arrived but the
//! authoritative (service-level) signal has not. It is not terminal.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;

/// Status prefixes that mark a job as terminal.
pub const TERMINAL_PREFIXES: [&str; 5] = ["Complete", "Done", "Failed", "Killed", "Finalizing"];

/// Raw tokens that mean the container went away abnormally.
const ABNORMAL_TOKENS: [&str; 8] = [
    "remove", "removed", "orphaned", "oom", "rejected", "shutdown", "kill", "killed",
];

/// Canonical job status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum JobStatus {
    /// The backend accepted the job but it has not started.
    Created,
    /// The job is starting or running.
    Running,
    /// Exit signal received, waiting for service-level confirmation.
    ///
    /// Carries the abnormal outcome for swarm/cluster jobs, e.g.
    /// `Waiting (Failed (Oom))`.
    Waiting(Option<Box<JobStatus>>),
    /// The job failed, optionally with a reason (`Failed (Oom)`).
    Failed(Option<String>),
    /// The job was killed by an operator.
    Killed,
    /// The job completed successfully.
    Complete,
    /// Legacy terminal marker.
    Done,
    /// Finalization has been claimed and is in progress.
    Finalizing,
    /// A status token this engine does not know. Passed through unchanged.
    Other(String),
}

impl JobStatus {
    /// Parse a canonical status string.
    ///
    /// This is the inverse of [`Display`](fmt::Display); unknown strings are
    /// kept as [`JobStatus::Other`].
    pub fn parse(s: &str) -> Self {
        match s {
            "Created" => Self::Created,
            "Running" => Self::Running,
            "Waiting" => Self::Waiting(None),
            "Failed" => Self::Failed(None),
            "Killed" => Self::Killed,
            "Complete" => Self::Complete,
            "Done" => Self::Done,
            "Finalizing" => Self::Finalizing,
            _ => {
                if let Some(inner) = strip_wrapped(s, "Waiting") {
                    return Self::Waiting(Some(Box::new(Self::parse(inner))));
                }
                if let Some(reason) = strip_wrapped(s, "Failed") {
                    return Self::Failed(Some(reason.to_string()));
                }
                Self::Other(s.to_string())
            }
        }
    }

    /// Whether this status is a sink for normal event processing.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Complete | Self::Done | Self::Failed(_) | Self::Killed | Self::Finalizing => {
                true
            }
            Self::Created | Self::Running | Self::Waiting(_) => false,
            Self::Other(raw) => is_terminal_status(raw),
        }
    }

    /// Whether the job is in the `Waiting` holding state.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting(_))
    }

    /// Whether this status describes an unsuccessful outcome.
    ///
    /// Looks through `Waiting (...)` to the wrapped outcome.
    pub fn is_failure(&self) -> bool {
        match self {
            Self::Failed(_) | Self::Killed => true,
            Self::Waiting(Some(inner)) => inner.is_failure(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("Created"),
            Self::Running => f.write_str("Running"),
            Self::Waiting(None) => f.write_str("Waiting"),
            Self::Waiting(Some(inner)) => write!(f, "Waiting ({})", inner),
            Self::Failed(None) => f.write_str("Failed"),
            Self::Failed(Some(reason)) => write!(f, "Failed ({})", reason),
            Self::Killed => f.write_str("Killed"),
            Self::Complete => f.write_str("Complete"),
            Self::Done => f.write_str("Done"),
            Self::Finalizing => f.write_str("Finalizing"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        status.to_string()
    }
}

/// `Head (inner)` -> `inner`
fn strip_wrapped<'a>(s: &'a str, head: &str) -> Option<&'a str> {
    s.strip_prefix(head)?.strip_prefix(" (")?.strip_suffix(')')
}

/// Prefix check on a canonical status string.
///
/// `"Failed (Killed)"` is terminal, `"Waiting (Failed (Oom))"` is not.
pub fn is_terminal_status(status: &str) -> bool {
    TERMINAL_PREFIXES
        .iter()
        .any(|prefix| status.starts_with(prefix))
}

/// Result of normalizing a raw backend status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    /// Canonical status.
    pub status: JobStatus,
    /// Whether the canonical status is terminal.
    pub terminal: bool,
}

/// Map a backend-native status token to a canonical status.
///
/// Total and pure. Unknown tokens are returned unchanged as
/// [`JobStatus::Other`] because backend vocabularies evolve.
///
/// For cluster jobs the `reason` attribute of a failed pod is consulted
/// (`OOMKilled`, `Evicted`, `DeadlineExceeded`, ...).
pub fn normalize(kind: BackendKind, raw: &str, attributes: &HashMap<String, String>) -> Normalized {
    let mut token = raw.trim().to_ascii_lowercase();
    if kind == BackendKind::Cluster
        && let Some(reason) = cluster_failure_token(&token, attributes)
    {
        token = reason.to_string();
    }

    let status = match token.as_str() {
        "created" | "create" | "new" | "pending" | "allocated" | "assigned" | "accepted"
        | "preparing" | "ready" => JobStatus::Created,
        "starting" | "start" | "running" | "restart" | "unpause" => JobStatus::Running,
        "complete" | "completed" | "succeeded" => JobStatus::Waiting(None),
        "die" | "exited" if kind == BackendKind::Plain => JobStatus::Waiting(None),
        "failed" => JobStatus::Failed(None),
        t if ABNORMAL_TOKENS.contains(&t) => {
            let failed = JobStatus::Failed(Some(capitalize(t)));
            // A swarm/cluster job is only done once the service is reaped.
            if kind.is_service_based() {
                JobStatus::Waiting(Some(Box::new(failed)))
            } else {
                failed
            }
        }
        _ => JobStatus::Other(raw.to_string()),
    };

    let terminal = status.is_terminal();
    Normalized { status, terminal }
}

fn cluster_failure_token(
    token: &str,
    attributes: &HashMap<String, String>,
) -> Option<&'static str> {
    if token != "failed" && token != "terminated" {
        return None;
    }
    match attributes.get("reason").map(String::as_str) {
        Some("OOMKilled") => Some("oom"),
        Some("DeadlineExceeded") => Some("killed"),
        Some("Evicted") | Some("NodeLost") | Some("NodeShutdown") | Some("Shutdown") => {
            Some("shutdown")
        }
        _ => None,
    }
}

fn capitalize(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
