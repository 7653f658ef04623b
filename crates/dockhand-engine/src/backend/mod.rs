// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend adapters - one per container backend kind.
//!
//! The reconciliation loop and the dispatcher only ever talk to
//! [`BackendAdapter`]. Each adapter wraps an abstract client for its backend
//! and is responsible for:
//! - normalizing raw statuses into [`BackendEvent`]s
//! - classifying exit events and post-exit noise
//! - mapping client failures into [`BackendError`]
//!
//! | Adapter | Backend | Push | Native id |
//! |---------|---------|------|-----------|
//! | [`plain::PlainAdapter`] | single-host container engine | polled event stream | container id |
//! | [`swarm::SwarmAdapter`] | swarm services | no | service id (+ task id) |
//! | [`cluster::ClusterAdapter`] | orchestrated cluster jobs | watch | job name (+ pod name) |

pub mod cluster;
pub mod mock;
pub mod plain;
pub mod swarm;

pub use cluster::{ClusterAdapter, ClusterClient, ClusterJobStatus, PodState};
pub use mock::MockBackend;
pub use plain::{ContainerEvent, EngineClient, PlainAdapter};
pub use swarm::{SwarmAdapter, SwarmClient, TaskState};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::status::{JobStatus, normalize};

/// Container backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Single-host container engine.
    Plain,
    /// Swarm services.
    Swarm,
    /// Orchestrated cluster (jobs and pods).
    Cluster,
}

impl BackendKind {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Swarm => "swarm",
            Self::Cluster => "cluster",
        }
    }

    /// Parse the string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plain" => Some(Self::Plain),
            "swarm" => Some(Self::Swarm),
            "cluster" => Some(Self::Cluster),
            _ => None,
        }
    }

    /// Whether jobs run as services whose tasks/pods come and go.
    pub fn is_service_based(&self) -> bool {
        matches!(self, Self::Swarm | Self::Cluster)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a job as the backend knows it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobRef {
    /// Backend kind.
    pub kind: BackendKind,
    /// Container id, service id or cluster job name.
    pub native_id: String,
    /// Task id / pod name, when known.
    pub task_id: Option<String>,
}

impl JobRef {
    /// Reference with no task.
    pub fn new(kind: BackendKind, native_id: impl Into<String>) -> Self {
        Self {
            kind,
            native_id: native_id.into(),
            task_id: None,
        }
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task_id {
            Some(task) => write!(f, "{}:{}/{}", self.kind, self.native_id, task),
            None => write!(f, "{}:{}", self.kind, self.native_id),
        }
    }
}

/// Normalized view of a backend notification or snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendEvent {
    /// Job the event is about.
    pub job: JobRef,
    /// Raw backend status token.
    pub raw_status: String,
    /// Canonical status.
    pub status: JobStatus,
    /// Exit code, if the backend reported one.
    pub exit_code: Option<i64>,
    /// Backend-reported timestamp.
    pub external_timestamp: Option<DateTime<Utc>>,
    /// Free-text message.
    pub message: Option<String>,
    /// Raw attributes.
    pub attributes: HashMap<String, String>,
    /// Node the task ran on.
    pub node_id: Option<String>,
    /// Authoritative exit signal: the job should be finalized.
    pub is_exit: bool,
    /// Post-exit noise that must not touch history.
    pub ignore: bool,
}

impl BackendEvent {
    /// Build an event by normalizing a raw status.
    pub fn new(job: JobRef, raw_status: impl Into<String>, attributes: HashMap<String, String>) -> Self {
        let raw_status = raw_status.into();
        let normalized = normalize(job.kind, &raw_status, &attributes);
        Self {
            job,
            raw_status,
            status: normalized.status,
            exit_code: None,
            external_timestamp: None,
            message: None,
            attributes,
            node_id: None,
            is_exit: false,
            ignore: false,
        }
    }

    /// Engine-made event with an explicit canonical status.
    pub fn synthetic(job: JobRef, status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            job,
            raw_status: status.to_string(),
            status,
            exit_code: None,
            external_timestamp: None,
            message: Some(message.into()),
            attributes: HashMap::new(),
            node_id: None,
            is_exit: false,
            ignore: false,
        }
    }

    /// Set the exit code.
    pub fn with_exit_code(mut self, exit_code: Option<i64>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Set the external timestamp.
    pub fn with_timestamp(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.external_timestamp = at;
        self
    }

    /// Set the message.
    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    /// Set the node id.
    pub fn with_node(mut self, node_id: Option<String>) -> Self {
        self.node_id = node_id;
        self
    }

    /// Mark as an exit event.
    pub fn exit(mut self, is_exit: bool) -> Self {
        self.is_exit = is_exit;
        self
    }

    /// Mark as noise.
    pub fn ignored(mut self, ignore: bool) -> Self {
        self.ignore = ignore;
        self
    }

    /// Whether the event describes a successful run.
    pub fn succeeded(&self) -> bool {
        !self.status.is_failure() && self.exit_code.unwrap_or(0) == 0
    }
}

/// Errors from backend adapter calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendError {
    /// The backend no longer knows the job (garbage collected, node lost).
    #[error("Not found on backend: {0}")]
    NotFound(String),

    /// The job exists but its task/pod could not be resolved.
    #[error("Task lookup failed for {job}: {reason}")]
    LookupFailed {
        /// The job reference.
        job: String,
        /// Why the lookup failed.
        reason: String,
    },

    /// Backend unreachable or timed out. Retried next tick.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend returned something unexpected.
    #[error("Malformed backend response: {0}")]
    Malformed(String),

    /// The adapter does not support the operation.
    #[error("Operation not supported by {0} backend")]
    Unsupported(BackendKind),
}

impl BackendError {
    /// Whether retrying later may succeed without any state change.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Errors reported by the concrete backend clients wrapped by the adapters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClientError {
    /// Connection refused, reset, or timed out.
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// The backend answered with an error status.
    #[error("Backend returned {code}: {message}")]
    Status {
        /// HTTP-style status code.
        code: u16,
        /// Error body.
        message: String,
    },

    /// The response could not be decoded.
    #[error("Failed to decode backend response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Map into the adapter error taxonomy.
    ///
    /// `subject` names the job the call was about.
    pub fn into_backend_error(self, subject: &str) -> BackendError {
        match self {
            Self::Unreachable(reason) => BackendError::Unavailable(reason),
            Self::Status { code: 404, .. } => BackendError::NotFound(subject.to_string()),
            Self::Status { code, message } if code >= 500 => {
                BackendError::Unavailable(format!("{}: {}", code, message))
            }
            Self::Status { code, message } => {
                BackendError::Malformed(format!("{} for {}: {}", code, subject, message))
            }
            Self::Decode(reason) => BackendError::Malformed(reason),
        }
    }
}

/// Capability interface over one container backend.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Backend kind served by this adapter.
    fn kind(&self) -> BackendKind;

    /// Check that the backend is configured and reachable.
    async fn ping(&self) -> Result<(), BackendError>;

    /// Jobs the backend currently considers non-terminal.
    async fn list_active_jobs(&self) -> Result<Vec<JobRef>, BackendError>;

    /// Point-in-time snapshot of one job.
    async fn describe(&self, job: &JobRef) -> Result<BackendEvent, BackendError>;

    /// Events between two instants (polled event streams).
    async fn events_since(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<BackendEvent>, BackendError> {
        let _ = (since, until);
        Err(BackendError::Unsupported(self.kind()))
    }

    /// Subscribe to pushed events, for push-capable backends.
    fn subscribe(&self) -> Option<broadcast::Receiver<BackendEvent>> {
        None
    }

    /// Whether a raw status is post-exit noise.
    fn is_noise(&self, raw_status: &str) -> bool {
        let _ = raw_status;
        false
    }

    /// Stop and remove a job.
    async fn kill(&self, job: &JobRef) -> Result<(), BackendError>;
}

/// Adapters by backend kind.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any adapter of the same kind.
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Adapter for a backend kind.
    pub fn get(&self, kind: BackendKind) -> Option<&Arc<dyn BackendAdapter>> {
        self.adapters.get(&kind)
    }

    /// All adapters, plain engine first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn BackendAdapter>> {
        [BackendKind::Plain, BackendKind::Swarm, BackendKind::Cluster]
            .into_iter()
            .filter_map(|kind| self.adapters.get(&kind))
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether no adapter is registered.
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Run a backend call, mapping an elapsed timeout to [`BackendError::Unavailable`].
pub async fn with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Unavailable(format!(
            "no answer within {:?}",
            timeout
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_round_trip() {
        for kind in [BackendKind::Plain, BackendKind::Swarm, BackendKind::Cluster] {
            assert_eq!(BackendKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(BackendKind::parse("nomad"), None);
    }

    #[test]
    fn test_event_success_classification() {
        let job = JobRef::new(BackendKind::Swarm, "svc");
        let ok = BackendEvent::new(job.clone(), "complete", HashMap::new()).with_exit_code(Some(0));
        assert!(ok.succeeded());

        let oom = BackendEvent::new(job.clone(), "oom", HashMap::new()).with_exit_code(Some(137));
        assert!(!oom.succeeded());

        let nonzero = BackendEvent::new(job, "complete", HashMap::new()).with_exit_code(Some(2));
        assert!(!nonzero.succeeded());
    }

    #[test]
    fn test_client_error_mapping() {
        let not_found = ClientError::Status {
            code: 404,
            message: "no such service".into(),
        };
        assert_eq!(
            not_found.into_backend_error("svc"),
            BackendError::NotFound("svc".into())
        );

        let server = ClientError::Status {
            code: 503,
            message: "busy".into(),
        }
        .into_backend_error("svc");
        assert!(server.is_transient());

        let decode = ClientError::Decode("eof".into()).into_backend_error("svc");
        assert!(matches!(decode, BackendError::Malformed(_)));
    }

    #[test]
    fn test_registry_orders_plain_first() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(MockBackend::new(BackendKind::Cluster)));
        registry.register(Arc::new(MockBackend::new(BackendKind::Plain)));
        let kinds: Vec<_> = registry.iter().map(|a| a.kind()).collect();
        assert_eq!(kinds, [BackendKind::Plain, BackendKind::Cluster]);
        assert!(registry.get(BackendKind::Swarm).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let mut backend = MockBackend::new(BackendKind::Swarm);
        backend.describe_delay_ms = 5_000;
        let job = JobRef::new(BackendKind::Swarm, "svc");

        let result = with_timeout(Duration::from_secs(1), backend.describe(&job)).await;
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
    }

    #[test]
    fn test_job_ref_display() {
        let mut job = JobRef::new(BackendKind::Cluster, "job-1");
        assert_eq!(job.to_string(), "cluster:job-1");
        job.task_id = Some("pod-a".into());
        assert_eq!(job.to_string(), "cluster:job-1/pod-a");
    }
}
