//! External collaborator seams
//!
//! The reconciliation loop consumes these; it never implements them. All
//! of them are read-only consultants: they answer, and the loop alone
//! mutates persisted state afterwards.

use crate::error::PortError;
use crate::types::{
    Classification, FailedRun, Notice, RerunReceipt, RerunRequest, StatusReport, SucceededRun,
};
use std::time::Duration;

/// Supplies failed/succeeded run lists and per-run status
#[async_trait::async_trait]
pub trait RunStatusSource: Send + Sync {
    /// Runs that failed within `window`
    async fn failed_runs(&self, window: Duration) -> Result<Vec<FailedRun>, PortError>;

    /// Runs that succeeded within `window`
    async fn succeeded_runs(&self, window: Duration) -> Result<Vec<SucceededRun>, PortError>;

    /// Current status of one run; `None` when the source cannot tell
    async fn run_status(&self, run_id: &str) -> Result<Option<StatusReport>, PortError>;
}

/// Decides whether and how a failure should be retried
#[async_trait::async_trait]
pub trait FailureClassifier: Send + Sync {
    async fn classify(
        &self,
        pipeline_name: &str,
        failed_step: Option<&str>,
        error_text: &str,
    ) -> Result<Classification, PortError>;
}

/// Starts remediation executions
#[async_trait::async_trait]
pub trait RemediationExecutor: Send + Sync {
    async fn trigger(&self, request: &RerunRequest) -> Result<RerunReceipt, PortError>;
}

/// Delivers rendered notices to humans
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &Notice) -> Result<(), PortError>;
}

/// Knowledge-base lookup for a documented fix
#[async_trait::async_trait]
pub trait SolutionLookup: Send + Sync {
    async fn lookup(&self, rationale: &str) -> Result<Option<String>, PortError>;
}

/// Lookup used when no knowledge base is wired in
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSolutionLookup;

#[async_trait::async_trait]
impl SolutionLookup for NoSolutionLookup {
    async fn lookup(&self, _rationale: &str) -> Result<Option<String>, PortError> {
        Ok(None)
    }
}
