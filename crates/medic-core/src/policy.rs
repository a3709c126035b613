//! Retry budget policy
//!
//! Pure decisions, no I/O:
//! - budget checks and consumption
//! - the "not recoverable" rationale rule
//! - turning a classification into remediate-or-escalate
//!
//! The budget is consumed when a triggered execution is observed to fail,
//! not when it is triggered.

use crate::types::{Classification, RemediationAction, RerunRequest};
use std::fmt;

/// Default number of remediation attempts per tracked run
pub const DEFAULT_INITIAL_BUDGET: i64 = 2;

/// Rationale substring that forces escalation by default
pub const DEFAULT_UNRECOVERABLE_MARKER: &str = "not recoverable";

/// Whether another remediation may be attempted
#[inline]
#[must_use]
pub fn has_budget(retry_count: i64) -> bool {
    retry_count >= 1
}

/// Budget after one observed failed attempt
#[inline]
#[must_use]
pub fn consume(retry_count: i64) -> i64 {
    retry_count.saturating_sub(1)
}

/// Case-insensitive substring rule over classifier rationales
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrecoverableRule {
    markers: Vec<String>,
}

impl UnrecoverableRule {
    #[must_use]
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(|m| m.as_ref().trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn matches(&self, rationale: &str) -> bool {
        let rationale = rationale.to_lowercase();
        self.markers.iter().any(|m| rationale.contains(m.as_str()))
    }

    #[must_use]
    pub fn markers(&self) -> &[String] {
        &self.markers
    }
}

impl Default for UnrecoverableRule {
    fn default() -> Self {
        Self::new([DEFAULT_UNRECOVERABLE_MARKER])
    }
}

/// Why automation stops for a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationReason {
    /// Retry budget ran out
    BudgetExhausted,
    /// Classifier said not to retry
    NotRetryable,
    /// Rationale matched the unrecoverable rule
    Unrecoverable,
    /// Classifier could not be consulted
    ClassifierFailed(String),
    /// Executor failed or returned nothing trackable
    TriggerFailed(String),
}

impl EscalationReason {
    /// One-line summary for the notice
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::BudgetExhausted => {
                "Retry limit exceeded, manual intervention needed.".to_string()
            }
            Self::NotRetryable => "Classifier advised against retrying.".to_string(),
            Self::Unrecoverable => "Failure judged not recoverable.".to_string(),
            Self::ClassifierFailed(e) => format!("Failure could not be classified: {e}"),
            Self::TriggerFailed(e) => format!("Rerun could not be started or tracked: {e}"),
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExhausted => f.write_str("budget-exhausted"),
            Self::NotRetryable => f.write_str("not-retryable"),
            Self::Unrecoverable => f.write_str("unrecoverable"),
            Self::ClassifierFailed(_) => f.write_str("classifier-failed"),
            Self::TriggerFailed(_) => f.write_str("trigger-failed"),
        }
    }
}

/// Requested rerun shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerunKind {
    Full,
    Partial,
}

/// Outcome of judging a classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Remediate(RerunKind),
    Escalate(EscalationReason),
}

/// Decide what to do with a classifier answer
///
/// The unrecoverable rule wins over a `full`/`partial` action.
#[must_use]
pub fn judge(classification: &Classification, rule: &UnrecoverableRule) -> Verdict {
    if rule.matches(&classification.rationale) {
        return Verdict::Escalate(EscalationReason::Unrecoverable);
    }
    match classification.action {
        RemediationAction::Full => Verdict::Remediate(RerunKind::Full),
        RemediationAction::Partial => Verdict::Remediate(RerunKind::Partial),
        RemediationAction::None => Verdict::Escalate(EscalationReason::NotRetryable),
    }
}

/// Build the executor request; a partial rerun needs a known step
#[must_use]
pub fn rerun_request(
    kind: RerunKind,
    pipeline_name: &str,
    original_run_id: &str,
    step: Option<&str>,
) -> RerunRequest {
    match (kind, step.map(str::trim).filter(|s| !s.is_empty())) {
        (RerunKind::Partial, Some(step)) => RerunRequest::FromStep {
            pipeline_name: pipeline_name.to_string(),
            original_run_id: original_run_id.to_string(),
            step: step.to_string(),
        },
        _ => RerunRequest::Full {
            pipeline_name: pipeline_name.to_string(),
            original_run_id: original_run_id.to_string(),
        },
    }
}
