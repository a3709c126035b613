//! Core types for Medic
//!
//! Defines:
//! - The persisted `RunRecord` and its partial `RecordUpdate`
//! - The shapes exchanged with external collaborators (failed/succeeded
//!   runs, run status, classifications, rerun requests, notices)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Key of a tracked run: (pipeline name, original run id)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub pipeline_name: String,
    pub run_id: String,
}

impl RunKey {
    #[inline]
    #[must_use]
    pub fn new(pipeline_name: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            run_id: run_id.into(),
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pipeline_name, self.run_id)
    }
}

/// Whether a remediation execution is currently being watched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// No remediation execution in flight
    Pending,
    /// `last_attempt_run_id` is in flight
    Running,
}

impl RecordStatus {
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Running => "running",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "running" => Ok(RecordStatus::Running),
            other => Err(format!("unknown record status '{other}'")),
        }
    }
}

/// Persisted remediation state of one failed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub pipeline_name: String,
    pub original_run_id: String,
    /// Remaining retry budget
    pub retry_count: i64,
    pub last_attempt_run_id: Option<String>,
    pub status: RecordStatus,
    /// A terminal notification went out for this record
    pub notified: bool,
    pub last_notification_time: Option<DateTime<Utc>>,
    /// Most recent error text seen for this run or its attempts
    pub last_error: Option<String>,
}

impl RunRecord {
    /// Fresh record as created by insert-if-absent
    #[must_use]
    pub fn new(
        pipeline_name: impl Into<String>,
        original_run_id: impl Into<String>,
        initial_budget: i64,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            original_run_id: original_run_id.into(),
            retry_count: initial_budget,
            last_attempt_run_id: None,
            status: RecordStatus::Pending,
            notified: false,
            last_notification_time: None,
            last_error: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> RunKey {
        RunKey::new(&self.pipeline_name, &self.original_run_id)
    }

    /// Attempt id if the record is running with a usable one
    #[must_use]
    pub fn running_attempt(&self) -> Option<&str> {
        match (self.status, self.last_attempt_run_id.as_deref()) {
            (RecordStatus::Running, Some(id)) if !id.is_empty() => Some(id),
            _ => None,
        }
    }

    /// `status == running` implies a non-empty attempt id
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.status == RecordStatus::Pending || self.running_attempt().is_some()
    }
}

/// Partial update: only `Some` fields are written
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub retry_count: Option<i64>,
    pub last_attempt_run_id: Option<String>,
    pub status: Option<RecordStatus>,
    pub notified: Option<bool>,
    pub last_notification_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RecordUpdate {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn retry_count(mut self, count: i64) -> Self {
        self.retry_count = Some(count);
        self
    }

    #[inline]
    #[must_use]
    pub fn last_attempt_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.last_attempt_run_id = Some(run_id.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn status(mut self, status: RecordStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[inline]
    #[must_use]
    pub fn notified_at(mut self, at: DateTime<Utc>) -> Self {
        self.notified = Some(true);
        self.last_notification_time = Some(at);
        self
    }

    #[inline]
    #[must_use]
    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply onto an in-memory copy, mirroring what the store writes
    pub fn apply_to(&self, record: &mut RunRecord) {
        if let Some(count) = self.retry_count {
            record.retry_count = count;
        }
        if let Some(id) = &self.last_attempt_run_id {
            record.last_attempt_run_id = Some(id.clone());
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(notified) = self.notified {
            record.notified = notified;
        }
        if let Some(at) = self.last_notification_time {
            record.last_notification_time = Some(at);
        }
        if let Some(error) = &self.last_error {
            record.last_error = Some(error.clone());
        }
    }
}

/// Why a run id sits in the settled ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettledReason {
    /// Run was created by the loop as a remediation execution
    Attempt,
    /// Original run recovered through a successful attempt
    Resolved,
}

impl SettledReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SettledReason::Attempt => "attempt",
            SettledReason::Resolved => "resolved",
        }
    }
}

/// Entry of the fetch-failed list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRun {
    pub pipeline_name: String,
    pub run_id: String,
    pub error_text: String,
    /// Failing step, when the source can tell
    pub failed_step: Option<String>,
}

impl FailedRun {
    #[must_use]
    pub fn new(
        pipeline_name: impl Into<String>,
        run_id: impl Into<String>,
        error_text: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            run_id: run_id.into(),
            error_text: error_text.into(),
            failed_step: None,
        }
    }

    #[must_use]
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.failed_step = Some(step.into());
        self
    }

    #[must_use]
    pub fn key(&self) -> RunKey {
        RunKey::new(&self.pipeline_name, &self.run_id)
    }
}

/// Entry of the fetch-succeeded list
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SucceededRun {
    pub pipeline_name: String,
    pub run_id: String,
}

impl SucceededRun {
    #[must_use]
    pub fn new(pipeline_name: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            run_id: run_id.into(),
        }
    }
}

/// Execution status as reported by the run source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    InProgress,
    Succeeded,
    Failed,
}

/// Result of get-status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: ExecutionStatus,
    /// Error text attached to a failed execution
    pub message: Option<String>,
}

impl StatusReport {
    #[must_use]
    pub fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            message: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Remediation action proposed by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemediationAction {
    /// Rerun the whole pipeline
    Full,
    /// Rerun from the failed step
    Partial,
    /// Do not retry
    None,
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RemediationAction::Full => "full",
            RemediationAction::Partial => "partial",
            RemediationAction::None => "none",
        })
    }
}

/// Classifier verdict with its free-text reasoning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub action: RemediationAction,
    pub rationale: String,
}

impl Classification {
    #[must_use]
    pub fn new(action: RemediationAction, rationale: impl Into<String>) -> Self {
        Self {
            action,
            rationale: rationale.into(),
        }
    }
}

/// What the executor is asked to start
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RerunRequest {
    /// Rerun the pipeline from the beginning, referencing the original run
    Full {
        pipeline_name: String,
        original_run_id: String,
    },
    /// Recovery rerun starting at `step`
    FromStep {
        pipeline_name: String,
        original_run_id: String,
        step: String,
    },
}

impl RerunRequest {
    #[must_use]
    pub fn pipeline_name(&self) -> &str {
        match self {
            RerunRequest::Full { pipeline_name, .. }
            | RerunRequest::FromStep { pipeline_name, .. } => pipeline_name,
        }
    }

    #[must_use]
    pub fn original_run_id(&self) -> &str {
        match self {
            RerunRequest::Full {
                original_run_id, ..
            }
            | RerunRequest::FromStep {
                original_run_id, ..
            } => original_run_id,
        }
    }

    #[must_use]
    pub fn step(&self) -> Option<&str> {
        match self {
            RerunRequest::Full { .. } => None,
            RerunRequest::FromStep { step, .. } => Some(step),
        }
    }
}

/// Executor reply; a missing id means the execution cannot be tracked
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RerunReceipt {
    pub new_run_id: Option<String>,
}

impl RerunReceipt {
    #[must_use]
    pub fn started(run_id: impl Into<String>) -> Self {
        Self {
            new_run_id: Some(run_id.into()),
        }
    }

    /// Usable run id, ignoring blank ones
    #[must_use]
    pub fn run_id(&self) -> Option<&str> {
        self.new_run_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Kind of message handed to the notifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    /// Terminal: automation gave up, a human must act
    Escalation,
    /// Informational: a rerun was started
    Rerun,
}

/// Rendered notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub pipeline_name: String,
    pub run_id: String,
    pub subject: String,
    pub body: String,
}
