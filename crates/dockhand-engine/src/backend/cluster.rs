// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Adapter for orchestrated cluster jobs.
//!
//! A job is a cluster job object; its pods are the tasks. The cluster pushes
//! pod updates through a watch, which the embedding application feeds into
//! [`ClusterAdapter::publish_pod`]. Subscribers receive normalized events over
//! a broadcast channel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use super::{BackendAdapter, BackendError, BackendEvent, BackendKind, ClientError, JobRef};

/// Buffered pushed events per subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One pod of a cluster job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodState {
    /// Pod name.
    pub pod_name: String,
    /// Owning job name.
    pub job_name: String,
    /// Pod phase: Pending, Running, Succeeded, Failed, Unknown.
    pub phase: String,
    /// Termination reason (OOMKilled, Evicted, DeadlineExceeded, ...).
    pub reason: Option<String>,
    /// Status message.
    pub message: Option<String>,
    /// Container exit code.
    pub exit_code: Option<i64>,
    /// Node the pod was bound to.
    pub node_name: Option<String>,
    /// When the pod terminated.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Status of a cluster job object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterJobStatus {
    /// Running pods.
    pub active: u32,
    /// Succeeded pods.
    pub succeeded: u32,
    /// Failed pods.
    pub failed: u32,
    /// Whether the job reached a Complete or Failed condition.
    pub finished: bool,
    /// Pods of the job.
    pub pods: Vec<PodState>,
}

/// Abstract client for the cluster API.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Check API server reachability.
    async fn ping(&self) -> Result<(), ClientError>;

    /// Status of a job. `None` once the job object is gone.
    async fn job_status(&self, job_name: &str) -> Result<Option<ClusterJobStatus>, ClientError>;

    /// Names of jobs without a finished condition.
    async fn list_active_jobs(&self) -> Result<Vec<String>, ClientError>;

    /// Delete a job and its pods.
    async fn delete_job(&self, job_name: &str) -> Result<(), ClientError>;
}

/// Cluster job adapter.
pub struct ClusterAdapter {
    client: Arc<dyn ClusterClient>,
    events: broadcast::Sender<BackendEvent>,
}

impl ClusterAdapter {
    /// Create an adapter over a cluster client.
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { client, events }
    }

    /// Normalize a watched pod update and push it to subscribers.
    ///
    /// `job_finished` is the job-level condition; a pod ending is not enough
    /// for the job to exit. Returns the number of subscribers reached.
    pub fn publish_pod(&self, pod: PodState, job_finished: bool) -> usize {
        let event = pod_event(
            JobRef::new(BackendKind::Cluster, pod.job_name.clone()),
            pod,
            job_finished,
        );
        match self.events.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No subscribers for cluster pod event");
                0
            }
        }
    }
}

fn pod_event(mut job: JobRef, pod: PodState, job_finished: bool) -> BackendEvent {
    let mut attributes = HashMap::new();
    if let Some(reason) = &pod.reason {
        attributes.insert("reason".to_string(), reason.clone());
    }
    let message = pod.message.clone().or_else(|| pod.reason.clone());
    job.task_id = Some(pod.pod_name.clone());

    BackendEvent::new(job, pod.phase, attributes)
        .with_exit_code(pod.exit_code)
        .with_timestamp(pod.finished_at)
        .with_message(message)
        .with_node(pod.node_name)
        .exit(job_finished)
}

#[async_trait]
impl BackendAdapter for ClusterAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Cluster
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.client
            .ping()
            .await
            .map_err(|e| e.into_backend_error("api server"))
    }

    async fn list_active_jobs(&self) -> Result<Vec<JobRef>, BackendError> {
        let names = self
            .client
            .list_active_jobs()
            .await
            .map_err(|e| e.into_backend_error("job list"))?;
        Ok(names
            .into_iter()
            .map(|name| JobRef::new(BackendKind::Cluster, name))
            .collect())
    }

    async fn describe(&self, job: &JobRef) -> Result<BackendEvent, BackendError> {
        let status = self
            .client
            .job_status(&job.native_id)
            .await
            .map_err(|e| e.into_backend_error(&job.native_id))?
            .ok_or_else(|| BackendError::NotFound(job.native_id.clone()))?;

        let pod = match &job.task_id {
            Some(pod_name) => status.pods.iter().find(|p| &p.pod_name == pod_name),
            None => status.pods.iter().max_by_key(|p| p.finished_at),
        };

        match pod {
            Some(pod) => Ok(pod_event(job.clone(), pod.clone(), status.finished)),
            // pods may already be garbage collected while the job object lingers
            None if status.finished => {
                let raw = if status.failed > 0 { "failed" } else { "succeeded" };
                Ok(BackendEvent::new(job.clone(), raw, HashMap::new())
                    .with_message(Some(format!(
                        "Job finished: {} succeeded, {} failed",
                        status.succeeded, status.failed
                    )))
                    .exit(true))
            }
            None => Err(BackendError::LookupFailed {
                job: job.to_string(),
                reason: "no pod found for job".to_string(),
            }),
        }
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<BackendEvent>> {
        Some(self.events.subscribe())
    }

    async fn kill(&self, job: &JobRef) -> Result<(), BackendError> {
        self.client
            .delete_job(&job.native_id)
            .await
            .map_err(|e| e.into_backend_error(&job.native_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::JobStatus;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeCluster {
        jobs: Mutex<HashMap<String, ClusterJobStatus>>,
    }

    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn ping(&self) -> Result<(), ClientError> {
            Ok(())
        }

        async fn job_status(&self, job_name: &str) -> Result<Option<ClusterJobStatus>, ClientError> {
            Ok(self.jobs.lock().await.get(job_name).cloned())
        }

        async fn list_active_jobs(&self) -> Result<Vec<String>, ClientError> {
            Ok(self
                .jobs
                .lock()
                .await
                .iter()
                .filter(|(_, s)| !s.finished)
                .map(|(name, _)| name.clone())
                .collect())
        }

        async fn delete_job(&self, job_name: &str) -> Result<(), ClientError> {
            self.jobs.lock().await.remove(job_name);
            Ok(())
        }
    }

    fn pod(phase: &str, reason: Option<&str>) -> PodState {
        PodState {
            pod_name: "job-1-abcde".into(),
            job_name: "job-1".into(),
            phase: phase.into(),
            reason: reason.map(str::to_string),
            message: None,
            exit_code: Some(137),
            node_name: Some("worker-2".into()),
            finished_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_published_pod_reaches_subscribers() {
        let adapter = ClusterAdapter::new(Arc::new(FakeCluster::default()));
        let mut rx = adapter.subscribe().unwrap();

        assert_eq!(adapter.publish_pod(pod("Failed", Some("OOMKilled")), false), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.status.to_string(), "Waiting (Failed (Oom))");
        assert_eq!(event.job.task_id.as_deref(), Some("job-1-abcde"));
        assert_eq!(event.message.as_deref(), Some("OOMKilled"));
        assert!(!event.is_exit);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let adapter = ClusterAdapter::new(Arc::new(FakeCluster::default()));
        assert_eq!(adapter.publish_pod(pod("Running", None), false), 0);
    }

    #[tokio::test]
    async fn test_describe_finished_job_without_pods() {
        let client = Arc::new(FakeCluster::default());
        client.jobs.lock().await.insert(
            "job-1".into(),
            ClusterJobStatus {
                succeeded: 1,
                finished: true,
                ..Default::default()
            },
        );
        let adapter = ClusterAdapter::new(client);

        let event = adapter
            .describe(&JobRef::new(BackendKind::Cluster, "job-1"))
            .await
            .unwrap();
        assert!(event.is_exit);
        assert_eq!(event.status, JobStatus::Waiting(None));
        assert!(event.succeeded());
    }

    #[tokio::test]
    async fn test_describe_running_job_without_pods_is_lookup_failure() {
        let client = Arc::new(FakeCluster::default());
        client
            .jobs
            .lock()
            .await
            .insert("job-1".into(), ClusterJobStatus::default());
        let adapter = ClusterAdapter::new(client);

        let err = adapter
            .describe(&JobRef::new(BackendKind::Cluster, "job-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::LookupFailed { .. }));

        let err = adapter
            .describe(&JobRef::new(BackendKind::Cluster, "job-2"))
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::NotFound("job-2".into()));
    }
}
