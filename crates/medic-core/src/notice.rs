//! Notice rendering
//!
//! One message per event, carrying everything an operator needs: the
//! decision and its rationale, any documented fix, the last error and the
//! reason automation stopped.

use crate::policy::EscalationReason;
use crate::types::{Classification, Notice, NoticeKind, RerunRequest, RunRecord};

/// Text used when the knowledge base has nothing to offer
pub const NO_DOCUMENTED_SOLUTION: &str = "No documented solution found.";

/// Inputs of an escalation notice
#[derive(Debug, Clone, Copy)]
pub struct Escalation<'a> {
    pub record: &'a RunRecord,
    pub reason: &'a EscalationReason,
    /// Classifier answer from this tick, if it was consulted
    pub classification: Option<&'a Classification>,
    pub solution: Option<&'a str>,
}

/// Render the terminal notice for a record
#[must_use]
pub fn escalation_notice(escalation: &Escalation<'_>) -> Notice {
    let record = escalation.record;
    let mut lines = vec![
        format!("Pipeline: {}", record.pipeline_name),
        format!("Run ID: {}", record.original_run_id),
    ];
    if let Some(classification) = escalation.classification {
        lines.push(format!("AI Decision: {}", classification.action));
        lines.push(format!("Rationale:\n{}", classification.rationale.trim()));
    }
    lines.push(format!(
        "\n--- Suggested Solution from Knowledge Base ---\n{}",
        escalation.solution.unwrap_or(NO_DOCUMENTED_SOLUTION)
    ));
    if let Some(error) = record.last_error.as_deref() {
        lines.push(format!("\nLast Error: {error}"));
    }
    if let Some(attempt) = record.last_attempt_run_id.as_deref() {
        lines.push(format!("Last Rerun: {attempt}"));
    }
    lines.push(format!("Retries Remaining: {}", record.retry_count.max(0)));
    lines.push(format!(
        "\n--- ESCALATION REQUIRED ---\n{}",
        escalation.reason.summary()
    ));
    let body = lines.join("\n");

    Notice {
        kind: NoticeKind::Escalation,
        pipeline_name: record.pipeline_name.clone(),
        run_id: record.original_run_id.clone(),
        subject: format!("Pipeline failure escalation - {}", record.pipeline_name),
        body,
    }
}

/// Render the informational notice for a started rerun
#[must_use]
pub fn rerun_notice(
    classification: &Classification,
    request: &RerunRequest,
    new_run_id: &str,
) -> Notice {
    let outcome = match request.step() {
        Some(step) => format!("started {new_run_id} from step {step}"),
        None => format!("started {new_run_id}"),
    };
    let body = [
        format!("Pipeline: {}", request.pipeline_name()),
        format!("Run ID: {}", request.original_run_id()),
        format!("AI Decision: {}", classification.action),
        format!("Rationale:\n{}", classification.rationale.trim()),
        format!("\nRerun Outcome: {outcome}"),
    ]
    .join("\n");

    Notice {
        kind: NoticeKind::Rerun,
        pipeline_name: request.pipeline_name().to_string(),
        run_id: request.original_run_id().to_string(),
        subject: format!("Pipeline rerun started - {}", request.pipeline_name()),
        body,
    }
}
