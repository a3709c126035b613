//! Reconciler Tests
//!
//! Drives full ticks against an in-memory store and scripted collaborators.
//! Store invariants are checked after every tick.

use chrono::{Duration as TimeDelta, TimeZone, Utc};
use medic_core::{
    Classification, ExecutionStatus, PortError, ReconcileConfig, Reconciler, RecordStatus,
    RemediationAction, RerunReceipt, RerunRequest, RetryStore, SqliteRetryStore, StatusReport,
    TickReport,
};
use medic_test_utils::{assert_store_invariants, failed, succeeded, Harness};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn setup() -> (Harness, Reconciler<SqliteRetryStore>) {
    setup_with(ReconcileConfig::new())
}

fn setup_with(config: ReconcileConfig) -> (Harness, Reconciler<SqliteRetryStore>) {
    let harness = Harness::new();
    let reconciler = harness.reconciler(config);
    (harness, reconciler)
}

async fn tick(reconciler: &Reconciler<SqliteRetryStore>) -> TickReport {
    let report = reconciler.tick().await.unwrap();
    assert_store_invariants(reconciler.store());
    report
}

fn attempt_failed(message: &str) -> StatusReport {
    StatusReport::new(ExecutionStatus::Failed).with_message(message)
}

#[tokio::test]
async fn scenario_a_fresh_failure_triggers_full_rerun() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout connecting to source")]);
    h.executor
        .set_answer(Some(Ok(RerunReceipt::started("R2"))));

    let report = tick(&r).await;

    assert_eq!(report.tracked, 1);
    assert_eq!(report.triggered, 1);
    let record = r.store().get("P1", "R1").unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Running);
    assert_eq!(record.last_attempt_run_id.as_deref(), Some("R2"));
    assert_eq!(record.retry_count, 2);
    assert!(!record.notified);
    assert_eq!(
        h.executor.requests(),
        vec![RerunRequest::Full {
            pipeline_name: "P1".into(),
            original_run_id: "R1".into(),
        }]
    );
    assert_eq!(h.classifier.calls()[0].error_text, "Timeout connecting to source");
    assert!(h.notifier.notices().is_empty());
}

#[tokio::test]
async fn scenario_b_failed_attempt_consumes_budget() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout connecting to source")]);
    h.executor
        .set_answer(Some(Ok(RerunReceipt::started("R2"))));
    tick(&r).await;

    h.source.set_status("R2", attempt_failed("Copy activity failed again"));
    let report = tick(&r).await;

    assert_eq!(report.requeued, 1);
    assert_eq!(report.triggered, 0);
    let record = r.store().get("P1", "R1").unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Pending);
    assert_eq!(record.retry_count, 1);
    assert_eq!(record.last_error.as_deref(), Some("Copy activity failed again"));
    assert_eq!(h.classifier.call_count(), 1);
    assert!(h.notifier.notices().is_empty());

    // Re-evaluated on the next tick: a second rerun with the last budget unit
    h.executor.set_answer(Some(Ok(RerunReceipt::started("R3"))));
    let report = tick(&r).await;
    assert_eq!(report.triggered, 1);
    let record = r.store().get("P1", "R1").unwrap().unwrap();
    assert_eq!(record.last_attempt_run_id.as_deref(), Some("R3"));
    assert_eq!(record.retry_count, 1);
}

#[tokio::test]
async fn scenario_c_exhausted_budget_escalates_exactly_once() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout connecting to source")]);

    tick(&r).await; // rerun-1 started
    h.source.set_status("rerun-1", attempt_failed("still failing"));
    tick(&r).await; // budget 2 -> 1
    tick(&r).await; // rerun-2 started
    h.source.set_status("rerun-2", attempt_failed("still failing"));
    let report = tick(&r).await; // budget 1 -> 0, escalate

    assert_eq!(report.escalated, 1);
    assert_eq!(h.executor.trigger_count(), 2);
    let escalations = h.notifier.escalations();
    assert_eq!(escalations.len(), 1);
    assert!(escalations[0].body.contains("Retry limit exceeded"));
    assert!(escalations[0].body.contains("Retries Remaining: 0"));
    let record = r.store().get("P1", "R1").unwrap().unwrap();
    assert_eq!(record.retry_count, 0);
    assert!(record.notified);

    for _ in 0..3 {
        let report = tick(&r).await;
        assert_eq!(report.escalated, 0);
        assert_eq!(report.suppressed, 1);
    }
    assert_eq!(h.notifier.escalations().len(), 1);
    assert_eq!(h.executor.trigger_count(), 2);
}

#[tokio::test]
async fn scenario_d_success_resets_tracking() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    h.classifier.set_answer(Ok(Classification::new(
        RemediationAction::None,
        "none. bad mapping",
    )));
    tick(&r).await;
    let record = r.store().get("P1", "R1").unwrap().unwrap();
    assert_eq!(record.retry_count, 0);

    h.source.set_failed(vec![]);
    h.source.set_succeeded(vec![succeeded("P1", "R1")]);
    let report = tick(&r).await;
    assert_eq!(report.resolved, 1);
    assert!(r.store().get("P1", "R1").unwrap().is_none());

    h.source.set_succeeded(vec![]);
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    h.classifier.set_answer(Ok(Classification::new(RemediationAction::Full, "full")));
    let report = tick(&r).await;
    assert_eq!(report.tracked, 1);
    let record = r.store().get("P1", "R1").unwrap().unwrap();
    assert_eq!(record.retry_count, 2);
    assert!(!record.notified);
}

#[tokio::test]
async fn scenario_e_unrecoverable_escalates_without_rerun() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Source table dropped")]);
    h.classifier.set_answer(Ok(Classification::new(
        RemediationAction::None,
        "none. The source object is gone, this is not recoverable by rerun.",
    )));

    let report = tick(&r).await;

    assert_eq!(report.escalated, 1);
    assert_eq!(h.executor.trigger_count(), 0);
    let record = r.store().get("P1", "R1").unwrap().unwrap();
    assert_eq!(record.retry_count, 0);
    assert!(record.notified);
    let escalations = h.notifier.escalations();
    assert_eq!(escalations.len(), 1);
    assert!(escalations[0].body.contains("AI Decision: none"));
    assert!(escalations[0].body.contains("--- ESCALATION REQUIRED ---"));
}

#[tokio::test]
async fn unrecoverable_rule_overrides_full_action() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Schema drift")]);
    h.classifier.set_answer(Ok(Classification::new(
        RemediationAction::Full,
        "full, although this is likely Not Recoverable",
    )));

    tick(&r).await;

    assert_eq!(h.executor.trigger_count(), 0);
    assert_eq!(h.notifier.escalations().len(), 1);
}

#[tokio::test]
async fn run_in_both_lists_resolves_without_classifier() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    tick(&r).await;

    h.source.set_succeeded(vec![succeeded("P1", "R1")]);
    let report = tick(&r).await;

    assert_eq!(report.resolved, 1);
    assert!(r.store().get("P1", "R1").unwrap().is_none());
    assert_eq!(h.classifier.call_count(), 1);
}

#[tokio::test]
async fn fresh_run_in_both_lists_is_not_tracked() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    h.source.set_succeeded(vec![succeeded("P1", "R1")]);

    let report = tick(&r).await;

    assert_eq!(report.tracked, 0);
    assert_eq!(h.classifier.call_count(), 0);
    assert!(r.store().list().unwrap().is_empty());
}

#[tokio::test]
async fn failed_attempt_never_opens_its_own_record() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    tick(&r).await; // rerun-1 started

    h.source.set_status("rerun-1", attempt_failed("Timeout again"));
    h.source.set_failed(vec![
        failed("P1", "R1", "Timeout"),
        failed("P1", "rerun-1", "Timeout again"),
    ]);
    let report = tick(&r).await;

    assert_eq!(report.skipped_settled, 1);
    assert_eq!(report.tracked, 0);
    let keys: Vec<_> = r
        .store()
        .list()
        .unwrap()
        .into_iter()
        .map(|rec| rec.original_run_id)
        .collect();
    assert_eq!(keys, vec!["R1".to_string()]);
}

#[tokio::test]
async fn attempt_success_resolves_and_settles_original() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    tick(&r).await; // rerun-1 started

    h.source
        .set_status("rerun-1", StatusReport::new(ExecutionStatus::Succeeded));
    let report = tick(&r).await;
    assert_eq!(report.resolved, 1);
    assert!(r.store().get("P1", "R1").unwrap().is_none());
    assert!(r.store().is_settled("P1", "R1").unwrap());

    // The original is still inside the fetch window
    let report = tick(&r).await;
    assert_eq!(report.skipped_settled, 1);
    assert!(r.store().list().unwrap().is_empty());
    assert_eq!(h.executor.trigger_count(), 1);
}

#[tokio::test]
async fn attempt_in_succeeded_list_resolves_original() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    tick(&r).await;

    h.source.set_succeeded(vec![succeeded("P1", "rerun-1")]);
    let report = tick(&r).await;

    assert_eq!(report.resolved, 1);
    assert!(r.store().list().unwrap().is_empty());
    assert!(h.source.status_calls().is_empty());
}

#[tokio::test]
async fn attempt_in_progress_waits() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    tick(&r).await;

    h.source
        .set_status("rerun-1", StatusReport::new(ExecutionStatus::InProgress));
    let report = tick(&r).await;
    assert_eq!(report.waiting, 1);

    h.source.clear_status("rerun-1");
    let report = tick(&r).await;
    assert_eq!(report.waiting, 1);

    h.source
        .fail_status(Some(PortError::Transport("connection reset".into())));
    let report = tick(&r).await;
    assert_eq!(report.waiting, 1);

    let record = r.store().get("P1", "R1").unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Running);
    assert_eq!(record.retry_count, 2);
    assert_eq!(h.classifier.call_count(), 1);
    assert_eq!(h.executor.trigger_count(), 1);
}

#[tokio::test]
async fn receipt_without_run_id_escalates_with_zero_budget() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    h.executor.set_answer(Some(Ok(RerunReceipt::default())));

    let report = tick(&r).await;

    assert_eq!(report.escalated, 1);
    let record = r.store().get("P1", "R1").unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Pending);
    assert_eq!(record.retry_count, 0);
    assert!(record.last_attempt_run_id.is_none());
    assert!(h.notifier.escalations()[0]
        .body
        .contains("Rerun could not be started"));
}

#[tokio::test]
async fn executor_error_escalates() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    h.executor.set_answer(Some(Err(PortError::Rejected {
        status: 409,
        body: "pipeline is disabled".into(),
    })));

    tick(&r).await;
    tick(&r).await;

    assert_eq!(h.executor.trigger_count(), 1);
    assert_eq!(h.notifier.escalations().len(), 1);
}

#[tokio::test]
async fn classifier_error_escalates_without_executor() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    h.classifier
        .set_answer(Err(PortError::Transport("dns failure".into())));

    let report = tick(&r).await;

    assert_eq!(report.escalated, 1);
    assert_eq!(h.executor.trigger_count(), 0);
    let record = r.store().get("P1", "R1").unwrap().unwrap();
    assert_eq!(record.retry_count, 0);
    let body = &h.notifier.escalations()[0].body;
    assert!(body.contains("could not be classified"));
    assert!(body.contains("Rationale:\nerror:"));
}

#[tokio::test(start_paused = true)]
async fn classifier_timeout_escalates() {
    let (h, r) = setup_with(ReconcileConfig::new().with_call_timeout(Duration::from_secs(5)));
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    h.classifier.set_delay(Some(Duration::from_secs(120)));

    let report = tick(&r).await;

    assert_eq!(report.escalated, 1);
    assert_eq!(h.executor.trigger_count(), 0);
    assert!(h.notifier.escalations()[0]
        .body
        .contains("classify timed out after 5s"));
}

#[tokio::test(start_paused = true)]
async fn source_timeouts_leave_running_record_waiting() {
    let (h, r) = setup_with(ReconcileConfig::new().with_call_timeout(Duration::from_secs(5)));
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    tick(&r).await;

    h.source.set_delay(Some(Duration::from_secs(120)));
    let report = tick(&r).await;

    assert_eq!(report.fetch_errors, 2);
    assert_eq!(report.waiting, 1);
    let record = r.store().get("P1", "R1").unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Running);
    assert_eq!(record.retry_count, 2);
}

#[tokio::test]
async fn notifier_failure_is_retried_next_tick() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    h.classifier.set_answer(Ok(Classification::new(
        RemediationAction::None,
        "none. credentials expired",
    )));
    h.notifier
        .fail_with(Some(PortError::Rejected {
            status: 500,
            body: "mail relay down".into(),
        }));

    let report = tick(&r).await;
    assert_eq!(report.notify_failures, 1);
    assert_eq!(report.escalated, 0);
    let record = r.store().get("P1", "R1").unwrap().unwrap();
    assert!(!record.notified);
    assert_eq!(record.retry_count, 0);

    h.notifier.fail_with(None);
    let report = tick(&r).await;
    assert_eq!(report.escalated, 1);
    assert!(r.store().get("P1", "R1").unwrap().unwrap().notified);
    assert_eq!(h.notifier.escalations().len(), 1);
    assert_eq!(h.notifier.attempts(), 2);
    // Frozen by the first tick; the classifier is not asked again
    assert_eq!(h.classifier.call_count(), 1);
}

#[tokio::test]
async fn allow_list_drops_foreign_pipelines() {
    let (h, r) = setup_with(ReconcileConfig::new().with_pipelines(["Ingest"]));
    h.source.set_failed(vec![
        failed("Ingest", "R1", "Timeout"),
        failed("Scratch", "R9", "Timeout"),
    ]);
    h.source.set_succeeded(vec![succeeded("Scratch", "R8")]);

    let report = tick(&r).await;

    assert_eq!(report.tracked, 1);
    let records = r.store().list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].pipeline_name, "Ingest");
    assert!(h
        .classifier
        .calls()
        .iter()
        .all(|c| c.pipeline_name == "Ingest"));
}

#[tokio::test]
async fn partial_rerun_starts_from_failed_step() {
    let (h, r) = setup();
    h.source
        .set_failed(vec![failed("P1", "R1", "Lookup failed").with_step("CopyOrders")]);
    h.classifier.set_answer(Ok(Classification::new(
        RemediationAction::Partial,
        "partial. only the copy step needs to run again",
    )));

    tick(&r).await;

    assert_eq!(
        h.executor.requests(),
        vec![RerunRequest::FromStep {
            pipeline_name: "P1".into(),
            original_run_id: "R1".into(),
            step: "CopyOrders".into(),
        }]
    );
    assert_eq!(h.classifier.calls()[0].failed_step.as_deref(), Some("CopyOrders"));
}

#[tokio::test]
async fn partial_rerun_without_step_runs_in_full() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Lookup failed")]);
    h.classifier.set_answer(Ok(Classification::new(
        RemediationAction::Partial,
        "partial",
    )));

    tick(&r).await;

    assert!(matches!(
        h.executor.requests().as_slice(),
        [RerunRequest::Full { .. }]
    ));
}

#[tokio::test]
async fn fetch_errors_still_revisit_tracked_records() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    tick(&r).await;
    h.source.set_status("rerun-1", attempt_failed("again"));

    h.source
        .fail_fetches(Some(PortError::Transport("management api down".into())));
    let report = tick(&r).await;

    assert_eq!(report.fetch_errors, 2);
    assert_eq!(report.requeued, 1);
    assert_eq!(r.store().get("P1", "R1").unwrap().unwrap().retry_count, 1);
}

#[tokio::test]
async fn pending_record_outside_window_is_classified_from_last_error() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    tick(&r).await;
    h.source.set_status("rerun-1", attempt_failed("Deadlock on target table"));
    tick(&r).await;

    // The original has aged out of the failed list
    h.source.set_failed(vec![]);
    let report = tick(&r).await;

    assert_eq!(report.triggered, 1);
    let calls = h.classifier.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].error_text, "Deadlock on target table");
    assert_eq!(calls[1].failed_step, None);
}

#[tokio::test]
async fn duplicate_failed_entries_are_handled_once() {
    let (h, r) = setup();
    h.source.set_failed(vec![
        failed("P1", "R1", "Timeout"),
        failed("P1", "R1", "Timeout"),
    ]);

    let report = tick(&r).await;

    assert_eq!(report.tracked, 1);
    assert_eq!(report.triggered, 1);
    assert_eq!(h.executor.trigger_count(), 1);
}

#[tokio::test]
async fn missing_error_text_uses_placeholder() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "   ")]);

    tick(&r).await;

    assert_eq!(h.classifier.calls()[0].error_text, medic_core::NO_ERROR_MESSAGE);
    assert!(r.store().get("P1", "R1").unwrap().unwrap().last_error.is_none());
}

#[tokio::test]
async fn rerun_notice_sent_when_enabled() {
    let (h, r) = setup_with(ReconcileConfig::new().with_notify_on_rerun(true));
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);

    tick(&r).await;

    let reruns = h.notifier.reruns();
    assert_eq!(reruns.len(), 1);
    assert!(reruns[0].body.contains("started rerun-1"));
    assert!(h.notifier.escalations().is_empty());
    assert!(!r.store().get("P1", "R1").unwrap().unwrap().notified);
}

#[tokio::test]
async fn rerun_notice_failure_does_not_block_tracking() {
    let (h, r) = setup_with(ReconcileConfig::new().with_notify_on_rerun(true));
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    h.notifier
        .fail_with(Some(PortError::Transport("webhook unreachable".into())));

    let report = tick(&r).await;

    assert_eq!(report.triggered, 1);
    assert_eq!(report.notify_failures, 0);
    let record = r.store().get("P1", "R1").unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Running);
}

#[tokio::test]
async fn escalation_carries_documented_solution() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Login failed")]);
    h.classifier.set_answer(Ok(Classification::new(
        RemediationAction::None,
        "none. the linked service password expired",
    )));
    h.solutions
        .set_answer(Some(Ok("Rotate the linked service secret in Key Vault".into())));

    tick(&r).await;

    assert_eq!(
        h.solutions.lookups(),
        vec!["none. the linked service password expired".to_string()]
    );
    assert!(h.notifier.escalations()[0]
        .body
        .contains("Rotate the linked service secret"));
}

#[tokio::test]
async fn solution_lookup_failure_falls_back() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Login failed")]);
    h.classifier.set_answer(Ok(Classification::new(
        RemediationAction::None,
        "none",
    )));
    h.solutions
        .set_answer(Some(Err(PortError::Transport("search index offline".into()))));

    tick(&r).await;

    assert!(h.notifier.escalations()[0]
        .body
        .contains(medic_core::NO_DOCUMENTED_SOLUTION));
}

#[tokio::test]
async fn budget_never_increases_without_recreate() {
    let (h, r) = setup();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    let mut last = i64::MAX;

    for round in 0..6 {
        tick(&r).await;
        h.source
            .set_status(&format!("rerun-{}", round + 1), attempt_failed("again"));
        if let Some(record) = r.store().get("P1", "R1").unwrap() {
            assert!(record.retry_count <= last);
            last = record.retry_count;
        }
    }
    assert_eq!(last, 0);
    assert_eq!(h.notifier.escalations().len(), 1);
}

#[tokio::test]
async fn attempt_running_past_ledger_retention_never_opens_its_own_record() {
    let (h, r) = setup();
    let start = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).unwrap();
    h.source.set_failed(vec![failed("P1", "R1", "Timeout")]);
    h.source
        .set_status("rerun-1", StatusReport::new(ExecutionStatus::InProgress));
    r.tick_at(start).await.unwrap();
    h.source.set_failed(vec![]);

    for hours in [6, 12, 18, 24] {
        let report = r.tick_at(start + TimeDelta::hours(hours)).await.unwrap();
        assert_eq!(report.waiting, 1);
    }

    // fails after more than a day in flight, past ledger retention
    h.source.set_status("rerun-1", attempt_failed("Copy activity timed out"));
    h.source
        .set_failed(vec![failed("P1", "rerun-1", "Copy activity timed out")]);
    let report = r.tick_at(start + TimeDelta::hours(26)).await.unwrap();
    assert_store_invariants(r.store());

    assert_eq!(report.tracked, 0);
    assert_eq!(report.skipped_settled, 1);
    assert_eq!(report.requeued, 1);
    assert!(r.store().get("P1", "rerun-1").unwrap().is_none());
    let record = r.store().get("P1", "R1").unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Pending);
    assert_eq!(record.retry_count, 1);

    // the next tick retries the original, not the attempt
    r.tick_at(start + TimeDelta::hours(27)).await.unwrap();
    assert!(r.store().get("P1", "rerun-1").unwrap().is_none());
    assert_eq!(r.store().list().unwrap().len(), 1);
    assert!(h
        .executor
        .requests()
        .iter()
        .all(|request| request.original_run_id() == "R1"));
    assert_eq!(h.executor.trigger_count(), 2);
}
