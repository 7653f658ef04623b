// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job aggregate and its history log.
//!
//! A [`Job`] is one launched unit of work: a plain container, a swarm service
//! or a cluster job. The dispatcher mutates it through
//! [`Job::append_history`]; only the finalization coordinator may call
//! [`Job::set_final_status`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendEvent, BackendKind, JobRef};
use crate::orchestration::StepSpec;
use crate::status::JobStatus;

/// Where a history entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrigin {
    /// Event reported by the backend (pushed or polled).
    BackendEvent,
    /// Written by the engine itself.
    System,
    /// Written on behalf of a user (e.g. kill).
    UserAction,
    /// Task/pod snapshot taken by the reconciliation loop.
    TaskSnapshot,
}

impl EntryOrigin {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BackendEvent => "backend_event",
            Self::System => "system",
            Self::UserAction => "user_action",
            Self::TaskSnapshot => "task_snapshot",
        }
    }

    /// Parse the storage form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backend_event" => Some(Self::BackendEvent),
            "system" => Some(Self::System),
            "user_action" => Some(Self::UserAction),
            "task_snapshot" => Some(Self::TaskSnapshot),
            _ => None,
        }
    }
}

/// One immutable history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Status at the time of the entry.
    pub status: JobStatus,
    /// Kind of source.
    pub origin: EntryOrigin,
    /// Source identifier, e.g. a username.
    pub origin_id: Option<String>,
    /// Engine clock when the entry was recorded.
    pub recorded_at: DateTime<Utc>,
    /// Timestamp reported by the backend.
    pub external_timestamp: Option<DateTime<Utc>>,
    /// Free text.
    pub message: Option<String>,
    /// Exit code, when known.
    pub exit_code: Option<i64>,
}

impl HistoryEntry {
    /// Entry written by the engine.
    pub fn system(status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            origin: EntryOrigin::System,
            origin_id: None,
            recorded_at: Utc::now(),
            external_timestamp: None,
            message: Some(message.into()),
            exit_code: None,
        }
    }

    /// Entry written on behalf of a user.
    pub fn user_action(status: JobStatus, username: &str, message: impl Into<String>) -> Self {
        Self {
            origin: EntryOrigin::UserAction,
            origin_id: Some(username.to_string()),
            ..Self::system(status, message)
        }
    }

    /// Entry built from a normalized backend event.
    pub fn from_event(event: &BackendEvent, origin: EntryOrigin) -> Self {
        Self {
            status: event.status.clone(),
            origin,
            origin_id: None,
            recorded_at: Utc::now(),
            external_timestamp: event.external_timestamp,
            message: event.message.clone(),
            exit_code: event.exit_code,
        }
    }

    /// Set the exit code.
    pub fn with_exit_code(mut self, exit_code: Option<i64>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Two entries with the same key are the same observation.
    fn same_observation(&self, other: &HistoryEntry) -> bool {
        self.status == other.status
            && self.external_timestamp == other.external_timestamp
            && self.message == other.message
    }
}

/// Append-only, deduplicating history ordered by recorded time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    /// Build from stored entries (any order).
    pub fn from_entries(mut entries: Vec<HistoryEntry>) -> Self {
        entries.sort_by_key(|e| e.recorded_at);
        Self { entries }
    }

    /// Whether an equivalent observation is already present.
    pub fn contains_equivalent(&self, entry: &HistoryEntry) -> bool {
        self.entries.iter().any(|e| e.same_observation(entry))
    }

    /// Insert keeping recorded-time order. Returns false for duplicates.
    pub fn insert(&mut self, entry: HistoryEntry) -> bool {
        if self.contains_equivalent(&entry) {
            return false;
        }
        let pos = self
            .entries
            .partition_point(|e| e.recorded_at <= entry.recorded_at);
        self.entries.insert(pos, entry);
        true
    }

    /// Entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Entries, newest first.
    pub fn descending(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().rev()
    }

    /// Most recent entry.
    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    /// Most recent entry of the given origin.
    pub fn latest_of(&self, origin: EntryOrigin) -> Option<&HistoryEntry> {
        self.descending().find(|e| e.origin == origin)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What [`Job::append_history`] did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Same observation already recorded; nothing changed.
    Duplicate,
    /// Recorded for audit; status unchanged (stale or job already terminal).
    Recorded,
    /// Recorded and the job status moved to the entry's status.
    Applied,
}

/// Role of a job in its launch tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSubtype {
    /// The user's job.
    #[default]
    Main,
    /// Prepares inputs for a parent job.
    Setup,
    /// Processes outputs of a parent job.
    WrapUp,
}

impl JobSubtype {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Setup => "setup",
            Self::WrapUp => "wrap_up",
        }
    }

    /// Parse the storage form, defaulting to main.
    pub fn parse(s: &str) -> Self {
        match s {
            "setup" => Self::Setup,
            "wrap_up" => Self::WrapUp,
            _ => Self::Main,
        }
    }
}

/// Finalization claim state. Ordered: a job only moves forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FinalizationState {
    /// Nobody has claimed finalization.
    #[default]
    Pending,
    /// Claimed, wrap-up in progress.
    Claimed,
    /// Wrap-up done.
    Finalized,
}

impl FinalizationState {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Finalized => "finalized",
        }
    }

    /// Parse the storage form, defaulting to pending.
    pub fn parse(s: &str) -> Self {
        match s {
            "claimed" => Self::Claimed,
            "finalized" => Self::Finalized,
            _ => Self::Pending,
        }
    }
}

/// Correlation with a multi-step orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationRef {
    /// Orchestration chain id.
    pub chain_id: i64,
    /// Index of the step this job runs.
    pub step_index: usize,
    /// Workflow that wraps the whole chain, if any.
    pub parent_workflow_id: Option<String>,
}

/// A declared job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Output name.
    pub name: String,
    /// Whether the output is visible outside the job (bindable by a later step).
    #[serde(default)]
    pub external: bool,
    /// Another output that must be handled first.
    #[serde(default)]
    pub depends_on: Option<String>,
    /// Path inside the job's output mount.
    #[serde(default)]
    pub path: Option<String>,
}

/// A resolved output value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputValue {
    /// Output name.
    pub name: String,
    /// Resolved value (URI, id, ...).
    pub value: String,
    /// Whether the output is external.
    pub external: bool,
}

/// The job aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Store id (0 until created).
    pub id: i64,
    /// Backend kind.
    pub backend: BackendKind,
    /// Plain-engine container id.
    pub container_id: Option<String>,
    /// Swarm service id or cluster job name.
    pub service_id: Option<String>,
    /// Swarm task id or cluster pod name.
    pub task_id: Option<String>,
    /// Node the task last ran on.
    pub node_id: Option<String>,
    /// Denormalized current status.
    pub status: JobStatus,
    /// When `status` was recorded.
    pub status_time: DateTime<Utc>,
    /// Status history.
    pub history: History,
    /// Role in the launch tree.
    pub subtype: JobSubtype,
    /// Parent job for setup/wrap-up jobs.
    pub parent_id: Option<i64>,
    /// Correlated external workflow.
    pub workflow_id: Option<String>,
    /// Orchestration correlation.
    pub orchestration: Option<OrchestrationRef>,
    /// Owning project.
    pub project: Option<String>,
    /// Launching user.
    pub username: Option<String>,
    /// Declared outputs.
    pub outputs: Vec<OutputSpec>,
    /// Outputs resolved during finalization.
    pub output_values: Vec<OutputValue>,
    /// Wrap-up jobs to launch during finalization.
    pub wrapup_steps: Vec<StepSpec>,
    /// Finalization claim state.
    pub finalization: FinalizationState,
    /// When the job record was created.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// A new, not yet stored job in `Created` state.
    pub fn new(backend: BackendKind) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            backend,
            container_id: None,
            service_id: None,
            task_id: None,
            node_id: None,
            status: JobStatus::Created,
            status_time: now,
            history: History::default(),
            subtype: JobSubtype::Main,
            parent_id: None,
            workflow_id: None,
            orchestration: None,
            project: None,
            username: None,
            outputs: Vec::new(),
            output_values: Vec::new(),
            wrapup_steps: Vec::new(),
            finalization: FinalizationState::Pending,
            created_at: now,
        }
    }

    /// Set the container id.
    pub fn with_container_id(mut self, id: impl Into<String>) -> Self {
        self.container_id = Some(id.into());
        self
    }

    /// Set the service id and task id.
    pub fn with_service(mut self, service_id: impl Into<String>, task_id: Option<String>) -> Self {
        self.service_id = Some(service_id.into());
        self.task_id = task_id;
        self
    }

    /// Set the correlated workflow id.
    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// The identifier the backend knows this job by.
    pub fn native_id(&self) -> Option<&str> {
        match self.backend {
            BackendKind::Plain => self.container_id.as_deref(),
            BackendKind::Swarm | BackendKind::Cluster => self.service_id.as_deref(),
        }
    }

    /// Backend reference for adapter calls.
    pub fn job_ref(&self) -> Option<JobRef> {
        let native_id = self.native_id()?.to_string();
        Some(JobRef {
            kind: self.backend,
            native_id,
            task_id: self.task_id.clone(),
        })
    }

    /// Whether the job is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append a history entry.
    ///
    /// The denormalized status moves only when the entry is strictly newer
    /// than the current status and the job is not already terminal. Stale or
    /// post-terminal entries are still kept for audit.
    pub fn append_history(&mut self, entry: HistoryEntry) -> AppendOutcome {
        if self.history.contains_equivalent(&entry) {
            return AppendOutcome::Duplicate;
        }

        let apply = entry.recorded_at > self.status_time && !self.status.is_terminal();
        if apply {
            self.status = entry.status.clone();
            self.status_time = entry.recorded_at;
        }
        self.history.insert(entry);

        if apply {
            AppendOutcome::Applied
        } else {
            AppendOutcome::Recorded
        }
    }

    /// Overwrite the status as part of finalization, recording why.
    ///
    /// Returns false and leaves the job untouched if the same entry is
    /// already in the history.
    pub fn set_final_status(&mut self, status: JobStatus, message: impl Into<String>) -> bool {
        let entry = HistoryEntry::system(status, message);
        if self.history.contains_equivalent(&entry) {
            return false;
        }
        self.status = entry.status.clone();
        self.status_time = entry.recorded_at;
        self.history.insert(entry)
    }

    /// Exit code of the most recent entry that carried one.
    pub fn last_exit_code(&self) -> Option<i64> {
        self.history.descending().find_map(|e| e.exit_code)
    }

    /// A short identity string for logs.
    pub fn describe(&self) -> String {
        format!(
            "job {} ({} {})",
            self.id,
            self.backend,
            self.native_id().unwrap_or("<no native id>")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry_at(status: JobStatus, at: DateTime<Utc>, message: &str) -> HistoryEntry {
        HistoryEntry {
            status,
            origin: EntryOrigin::BackendEvent,
            origin_id: None,
            recorded_at: at,
            external_timestamp: Some(at),
            message: Some(message.to_string()),
            exit_code: None,
        }
    }

    #[test]
    fn test_status_follows_latest_entry() {
        let mut job = Job::new(BackendKind::Swarm).with_service("svc-1", None);
        let t0 = job.status_time;
        let seq = [
            JobStatus::Created,
            JobStatus::Running,
            JobStatus::Waiting(None),
        ];
        for (i, status) in seq.iter().enumerate() {
            let at = t0 + Duration::seconds(i as i64 + 1);
            assert_eq!(
                job.append_history(entry_at(status.clone(), at, &format!("e{i}"))),
                AppendOutcome::Applied
            );
        }
        assert_eq!(job.status, JobStatus::Waiting(None));
        assert_eq!(job.history.len(), 3);
    }

    #[test]
    fn test_terminal_status_is_a_sink() {
        let mut job = Job::new(BackendKind::Plain).with_container_id("c1");
        let t0 = job.status_time;
        job.append_history(entry_at(
            JobStatus::Failed(Some("Oom".into())),
            t0 + Duration::seconds(1),
            "oom",
        ));
        let outcome = job.append_history(entry_at(
            JobStatus::Running,
            t0 + Duration::seconds(2),
            "late start",
        ));

        assert_eq!(outcome, AppendOutcome::Recorded);
        assert_eq!(job.status, JobStatus::Failed(Some("Oom".into())));
        assert_eq!(job.history.len(), 2);
    }

    #[test]
    fn test_stale_entry_is_recorded_not_applied() {
        let mut job = Job::new(BackendKind::Plain).with_container_id("c1");
        let t0 = job.status_time;
        job.append_history(entry_at(JobStatus::Running, t0 + Duration::seconds(5), "run"));
        let outcome = job.append_history(entry_at(
            JobStatus::Created,
            t0 + Duration::seconds(1),
            "created",
        ));

        assert_eq!(outcome, AppendOutcome::Recorded);
        assert_eq!(job.status, JobStatus::Running);
        // ordered by recorded time, not arrival
        let first = job.history.iter().next().unwrap();
        assert_eq!(first.status, JobStatus::Created);
    }

    #[test]
    fn test_duplicate_observation_is_suppressed() {
        let mut job = Job::new(BackendKind::Plain).with_container_id("c1");
        let t = job.status_time + Duration::seconds(1);
        let entry = entry_at(JobStatus::Running, t, "start");
        assert_eq!(job.append_history(entry.clone()), AppendOutcome::Applied);

        let mut again = entry;
        again.recorded_at = t + Duration::seconds(10);
        again.origin = EntryOrigin::TaskSnapshot;
        assert_eq!(job.append_history(again), AppendOutcome::Duplicate);
        assert_eq!(job.history.len(), 1);
    }

    #[test]
    fn test_latest_of_origin() {
        let mut job = Job::new(BackendKind::Plain).with_container_id("c1");
        let t0 = job.status_time;
        job.append_history(entry_at(JobStatus::Running, t0 + Duration::seconds(1), "a"));
        let mut user = HistoryEntry::user_action(JobStatus::Killed, "alice", "kill");
        user.recorded_at = t0 + Duration::seconds(2);
        job.append_history(user);
        job.append_history(entry_at(
            JobStatus::Waiting(None),
            t0 + Duration::seconds(3),
            "b",
        ));

        let latest_user = job.history.latest_of(EntryOrigin::UserAction).unwrap();
        assert_eq!(latest_user.origin_id.as_deref(), Some("alice"));
        let newest: Vec<_> = job.history.descending().map(|e| e.status.clone()).collect();
        assert_eq!(newest[0], JobStatus::Waiting(None));
        assert_eq!(job.history.latest().unwrap().message.as_deref(), Some("b"));
    }

    #[test]
    fn test_set_final_status_overrides_terminal() {
        let mut job = Job::new(BackendKind::Plain).with_container_id("c1");
        job.set_final_status(JobStatus::Finalizing, "claimed");
        job.set_final_status(JobStatus::Complete, "done");
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.history.len(), 2);
    }

    #[test]
    fn test_repeated_final_status_is_not_reapplied() {
        let mut job = Job::new(BackendKind::Swarm).with_service("svc-1", None);
        assert!(job.set_final_status(JobStatus::Killed, "Aligned with workflow status Killed"));
        let at = job.status_time;

        job.status = JobStatus::Failed(None);
        assert!(!job.set_final_status(JobStatus::Killed, "Aligned with workflow status Killed"));
        assert_eq!(job.status, JobStatus::Failed(None));
        assert_eq!(job.status_time, at);
        assert_eq!(job.history.len(), 1);
    }

    #[test]
    fn test_native_id_per_backend() {
        let plain = Job::new(BackendKind::Plain).with_container_id("abc");
        assert_eq!(plain.native_id(), Some("abc"));
        let swarm = Job::new(BackendKind::Swarm).with_service("svc", Some("task".into()));
        let job_ref = swarm.job_ref().unwrap();
        assert_eq!(job_ref.native_id, "svc");
        assert_eq!(job_ref.task_id.as_deref(), Some("task"));
    }
}
