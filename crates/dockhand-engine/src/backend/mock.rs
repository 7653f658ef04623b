// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock backend for testing.
//!
//! A scriptable adapter that serves canned snapshots and events without
//! talking to any container backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast};

use super::{BackendAdapter, BackendError, BackendEvent, BackendKind, JobRef};

/// Mock backend for testing.
pub struct MockBackend {
    kind: BackendKind,
    snapshots: Arc<Mutex<HashMap<String, Result<BackendEvent, BackendError>>>>,
    events: Arc<Mutex<Vec<BackendEvent>>>,
    active: Arc<Mutex<Vec<JobRef>>>,
    ping_error: Arc<Mutex<Option<BackendError>>>,
    events_error: Arc<Mutex<Option<BackendError>>>,
    killed: Arc<Mutex<Vec<JobRef>>>,
    push: Option<broadcast::Sender<BackendEvent>>,
    describe_calls: AtomicUsize,
    /// Delay before `describe` answers, in milliseconds
    pub describe_delay_ms: u64,
}

impl MockBackend {
    /// Create a mock backend of the given kind.
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            snapshots: Arc::new(Mutex::new(HashMap::new())),
            events: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(Mutex::new(Vec::new())),
            ping_error: Arc::new(Mutex::new(None)),
            events_error: Arc::new(Mutex::new(None)),
            killed: Arc::new(Mutex::new(Vec::new())),
            push: None,
            describe_calls: AtomicUsize::new(0),
            describe_delay_ms: 0,
        }
    }

    /// Create a push-capable mock backend.
    pub fn with_push(kind: BackendKind) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            push: Some(tx),
            ..Self::new(kind)
        }
    }

    /// Serve `result` for `describe` of a native id.
    pub async fn set_describe(&self, native_id: &str, result: Result<BackendEvent, BackendError>) {
        self.snapshots
            .lock()
            .await
            .insert(native_id.to_string(), result);
    }

    /// Queue an event for the next `events_since` call.
    pub async fn queue_event(&self, event: BackendEvent) {
        self.events.lock().await.push(event);
    }

    /// Set the jobs the backend reports as active.
    pub async fn set_active(&self, jobs: Vec<JobRef>) {
        *self.active.lock().await = jobs;
    }

    /// Make `ping` fail (or succeed again with `None`).
    pub async fn set_ping_error(&self, error: Option<BackendError>) {
        *self.ping_error.lock().await = error;
    }

    /// Make `events_since` fail (or succeed again with `None`).
    pub async fn set_events_error(&self, error: Option<BackendError>) {
        *self.events_error.lock().await = error;
    }

    /// Push an event to subscribers. Returns false if the mock is not push-capable
    /// or nobody listens.
    pub fn push(&self, event: BackendEvent) -> bool {
        match &self.push {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Jobs killed so far.
    pub async fn killed(&self) -> Vec<JobRef> {
        self.killed.lock().await.clone()
    }

    /// Number of `describe` calls so far.
    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendAdapter for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn ping(&self) -> Result<(), BackendError> {
        match self.ping_error.lock().await.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn list_active_jobs(&self) -> Result<Vec<JobRef>, BackendError> {
        Ok(self.active.lock().await.clone())
    }

    async fn describe(&self, job: &JobRef) -> Result<BackendEvent, BackendError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        if self.describe_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.describe_delay_ms)).await;
        }
        self.snapshots
            .lock()
            .await
            .get(&job.native_id)
            .cloned()
            .unwrap_or_else(|| Err(BackendError::NotFound(job.native_id.clone())))
    }

    async fn events_since(
        &self,
        _since: DateTime<Utc>,
        _until: DateTime<Utc>,
    ) -> Result<Vec<BackendEvent>, BackendError> {
        if let Some(e) = self.events_error.lock().await.clone() {
            return Err(e);
        }
        Ok(std::mem::take(&mut *self.events.lock().await))
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<BackendEvent>> {
        self.push.as_ref().map(|tx| tx.subscribe())
    }

    fn is_noise(&self, raw_status: &str) -> bool {
        raw_status == "destroy"
    }

    async fn kill(&self, job: &JobRef) -> Result<(), BackendError> {
        self.killed.lock().await.push(job.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unscripted_describe_is_not_found() {
        let backend = MockBackend::new(BackendKind::Swarm);
        let job = JobRef::new(BackendKind::Swarm, "svc");
        assert_eq!(
            backend.describe(&job).await,
            Err(BackendError::NotFound("svc".into()))
        );
        assert_eq!(backend.describe_calls(), 1);
    }

    #[tokio::test]
    async fn test_queued_events_are_drained() {
        let backend = MockBackend::new(BackendKind::Plain);
        let job = JobRef::new(BackendKind::Plain, "c1");
        backend
            .queue_event(BackendEvent::new(job, "start", HashMap::new()))
            .await;

        let now = Utc::now();
        assert_eq!(backend.events_since(now, now).await.unwrap().len(), 1);
        assert!(backend.events_since(now, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_requires_subscriber() {
        let backend = MockBackend::with_push(BackendKind::Cluster);
        let event = BackendEvent::new(
            JobRef::new(BackendKind::Cluster, "job-1"),
            "Running",
            HashMap::new(),
        );
        assert!(!backend.push(event.clone()));

        let mut rx = backend.subscribe().unwrap();
        assert!(backend.push(event.clone()));
        assert_eq!(rx.recv().await.unwrap(), event);
        assert!(MockBackend::new(BackendKind::Plain).subscribe().is_none());
    }
}
