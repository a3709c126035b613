//! Reconciliation loop
//!
//! One `tick` is a full fetch-reconcile-act pass over a snapshot of failed
//! and succeeded runs:
//!
//! ```text
//! prune ledger → fetch snapshot → apply successes → apply failures → revisit the rest
//! ```
//!
//! Per record, the transitions are:
//!
//! | state   | observation                     | action                                   |
//! |---------|---------------------------------|------------------------------------------|
//! | absent  | in failed list                  | create pending with the initial budget   |
//! | any     | original or attempt succeeded   | delete                                   |
//! | running | attempt in progress / unknown   | wait                                     |
//! | running | attempt failed                  | consume budget, pending; escalate at 0   |
//! | pending | no budget                       | escalate (once)                          |
//! | pending | budget                          | classify, then rerun or escalate         |
//!
//! External failures never abort a tick. Only store failures propagate.

use crate::error::{PortError, StoreError};
use crate::notice::{escalation_notice, rerun_notice, Escalation};
use crate::policy::{self, EscalationReason, RerunKind, UnrecoverableRule, Verdict};
use crate::ports::{
    FailureClassifier, NoSolutionLookup, Notifier, RemediationExecutor, RunStatusSource,
    SolutionLookup,
};
use crate::store::RetryStore;
use crate::types::{
    Classification, ExecutionStatus, FailedRun, RecordStatus, RecordUpdate, RemediationAction,
    RunKey, RunRecord, SettledReason, SucceededRun,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Error text used when neither the snapshot nor the record has one
pub const NO_ERROR_MESSAGE: &str = "No error message.";

/// Tunables of the reconciliation loop
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Budget of a freshly tracked run
    pub initial_budget: i64,
    /// Look-back window for the failed/succeeded queries
    pub fetch_window: Duration,
    /// Bound on every external call
    pub call_timeout: Duration,
    /// How long settled run ids are remembered
    pub ledger_retention: Duration,
    /// Monitored pipelines; empty means all
    pub pipelines: BTreeSet<String>,
    pub unrecoverable: UnrecoverableRule,
    /// Send an informational notice for every started rerun
    pub notify_on_rerun: bool,
}

impl ReconcileConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_initial_budget(mut self, budget: i64) -> Self {
        self.initial_budget = budget;
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_pipelines<I, S>(mut self, pipelines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pipelines = pipelines.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_notify_on_rerun(mut self, enabled: bool) -> Self {
        self.notify_on_rerun = enabled;
        self
    }

    /// Allow-list check applied to both fetched lists
    #[inline]
    #[must_use]
    pub fn monitors(&self, pipeline_name: &str) -> bool {
        self.pipelines.is_empty() || self.pipelines.contains(pipeline_name)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            initial_budget: policy::DEFAULT_INITIAL_BUDGET,
            fetch_window: Duration::from_secs(2 * 60 * 60),
            call_timeout: Duration::from_secs(60),
            ledger_retention: Duration::from_secs(24 * 60 * 60),
            pipelines: BTreeSet::new(),
            unrecoverable: UnrecoverableRule::default(),
            notify_on_rerun: false,
        }
    }
}

/// External collaborators consulted during a tick
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn RunStatusSource>,
    pub classifier: Arc<dyn FailureClassifier>,
    pub executor: Arc<dyn RemediationExecutor>,
    pub notifier: Arc<dyn Notifier>,
    pub solutions: Arc<dyn SolutionLookup>,
}

impl Collaborators {
    /// Wire collaborators without a knowledge base
    #[must_use]
    pub fn new(
        source: Arc<dyn RunStatusSource>,
        classifier: Arc<dyn FailureClassifier>,
        executor: Arc<dyn RemediationExecutor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            source,
            classifier,
            executor,
            notifier,
            solutions: Arc::new(NoSolutionLookup),
        }
    }

    #[must_use]
    pub fn with_solutions(mut self, solutions: Arc<dyn SolutionLookup>) -> Self {
        self.solutions = solutions;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// New records opened from the failed list
    pub tracked: usize,
    /// Records deleted because the original or an attempt succeeded
    pub resolved: usize,
    /// Reruns started
    pub triggered: usize,
    /// Running records whose attempt is still in flight or unknown
    pub waiting: usize,
    /// Attempts that failed with budget left
    pub requeued: usize,
    /// Escalation notices delivered
    pub escalated: usize,
    /// Escalations skipped because the record was already notified
    pub suppressed: usize,
    /// Failed entries ignored because the ledger knows them
    pub skipped_settled: usize,
    /// Failed/succeeded fetches that errored
    pub fetch_errors: usize,
    /// Escalation notices the notifier did not accept
    pub notify_failures: usize,
}

/// Drives every tracked run through the retry state machine
#[derive(Debug)]
pub struct Reconciler<S> {
    store: S,
    ports: Collaborators,
    config: ReconcileConfig,
}

impl<S: RetryStore> Reconciler<S> {
    #[must_use]
    pub fn new(store: S, ports: Collaborators, config: ReconcileConfig) -> Self {
        Self {
            store,
            ports,
            config,
        }
    }

    #[inline]
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Run one tick at the current time
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick, stamping ledger entries and notices with `now`
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
        let span = tracing::info_span!("tick", at = %now.format("%Y-%m-%dT%H:%M:%SZ"));
        async move {
            let mut report = TickReport::default();

            let retention = chrono::Duration::from_std(self.config.ledger_retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
            let pruned = self.store.prune_settled(now - retention)?;
            if pruned > 0 {
                tracing::debug!(pruned, "settled ledger pruned");
            }

            let (failed, succeeded) = self.fetch_snapshot(&mut report).await;
            let mut handled = self.apply_successes(&succeeded, now, &mut report)?;
            self.apply_failures(failed, &mut handled, now, &mut report)
                .await?;

            for record in self.store.list()? {
                if handled.contains(&record.key()) {
                    continue;
                }
                let span = record_span(&record);
                self.advance(record, None, now, &mut report)
                    .instrument(span)
                    .await?;
            }

            tracing::info!(
                tracked = report.tracked,
                resolved = report.resolved,
                triggered = report.triggered,
                waiting = report.waiting,
                requeued = report.requeued,
                escalated = report.escalated,
                suppressed = report.suppressed,
                skipped_settled = report.skipped_settled,
                fetch_errors = report.fetch_errors,
                notify_failures = report.notify_failures,
                "tick complete"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn fetch_snapshot(
        &self,
        report: &mut TickReport,
    ) -> (Vec<FailedRun>, Vec<SucceededRun>) {
        let window = self.config.fetch_window;

        let failed = match self
            .bounded("fetch-failed", self.ports.source.failed_runs(window))
            .await
        {
            Ok(runs) => runs,
            Err(e) => {
                tracing::warn!(error = %e, "failed-run fetch errored, continuing without it");
                report.fetch_errors += 1;
                Vec::new()
            }
        };
        let succeeded = match self
            .bounded("fetch-succeeded", self.ports.source.succeeded_runs(window))
            .await
        {
            Ok(runs) => runs,
            Err(e) => {
                tracing::warn!(error = %e, "succeeded-run fetch errored, continuing without it");
                report.fetch_errors += 1;
                Vec::new()
            }
        };

        let failed: Vec<_> = failed
            .into_iter()
            .filter(|r| self.config.monitors(&r.pipeline_name))
            .collect();
        let succeeded: Vec<_> = succeeded
            .into_iter()
            .filter(|r| self.config.monitors(&r.pipeline_name))
            .collect();
        tracing::debug!(
            failed = failed.len(),
            succeeded = succeeded.len(),
            "snapshot fetched"
        );
        (failed, succeeded)
    }

    /// Successes first, so a run in both lists counts as resolved
    ///
    /// Returns every key the failure phase must skip: the succeeded runs
    /// themselves plus originals resolved through their attempt.
    fn apply_successes(
        &self,
        succeeded: &[SucceededRun],
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<HashSet<RunKey>, StoreError> {
        let succeeded: HashSet<RunKey> = succeeded
            .iter()
            .map(|s| RunKey::new(&s.pipeline_name, &s.run_id))
            .collect();
        let mut resolved = succeeded.clone();
        if succeeded.is_empty() {
            return Ok(resolved);
        }

        for record in self.store.list()? {
            let key = record.key();
            if succeeded.contains(&key) {
                self.store
                    .delete(&record.pipeline_name, &record.original_run_id)?;
                tracing::info!(
                    pipeline = %record.pipeline_name,
                    run_id = %record.original_run_id,
                    "original run succeeded, tracking reset"
                );
                report.resolved += 1;
                resolved.insert(key);
            } else if let Some(attempt) = record
                .last_attempt_run_id
                .as_deref()
                .filter(|a| succeeded.contains(&RunKey::new(&record.pipeline_name, *a)))
            {
                self.resolve_via_attempt(&record, attempt, now)?;
                report.resolved += 1;
                resolved.insert(key);
            }
        }
        Ok(resolved)
    }

    async fn apply_failures(
        &self,
        failed: Vec<FailedRun>,
        handled: &mut HashSet<RunKey>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        for failure in failed {
            let key = failure.key();
            if !handled.insert(key) {
                continue;
            }
            if self
                .store
                .is_settled(&failure.pipeline_name, &failure.run_id)?
            {
                tracing::debug!(
                    pipeline = %failure.pipeline_name,
                    run_id = %failure.run_id,
                    "failed run already settled, ignoring"
                );
                report.skipped_settled += 1;
                continue;
            }

            if self.store.insert_if_absent(
                &failure.pipeline_name,
                &failure.run_id,
                self.config.initial_budget,
            )? {
                tracing::info!(
                    pipeline = %failure.pipeline_name,
                    run_id = %failure.run_id,
                    budget = self.config.initial_budget,
                    "new failed run tracked"
                );
                report.tracked += 1;
            }

            let Some(mut record) = self.store.get(&failure.pipeline_name, &failure.run_id)? else {
                continue;
            };
            let error_text = failure.error_text.trim();
            if !error_text.is_empty() && record.last_error.is_none() {
                let update = RecordUpdate::new().last_error(error_text);
                self.store
                    .update(&record.pipeline_name, &record.original_run_id, &update)?;
                update.apply_to(&mut record);
            }

            let span = record_span(&record);
            self.advance(record, Some(&failure), now, report)
                .instrument(span)
                .await?;
        }
        Ok(())
    }

    /// One state machine step for one record
    async fn advance(
        &self,
        record: RunRecord,
        failure: Option<&FailedRun>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        if let Some(attempt) = record.running_attempt().map(str::to_string) {
            return self.watch_attempt(record, &attempt, now, report).await;
        }
        if record.status == RecordStatus::Running {
            tracing::warn!("running record carries no attempt id, treating as pending");
        }
        self.evaluate_pending(record, failure, now, report).await
    }

    async fn watch_attempt(
        &self,
        mut record: RunRecord,
        attempt: &str,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        let status = match self
            .bounded("get-status", self.ports.source.run_status(attempt))
            .await
        {
            Ok(Some(status)) => status,
            Ok(None) => {
                tracing::debug!(attempt, "attempt status unknown, waiting");
                self.keep_attempt_settled(&record, attempt, now)?;
                report.waiting += 1;
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "attempt status unavailable, waiting");
                self.keep_attempt_settled(&record, attempt, now)?;
                report.waiting += 1;
                return Ok(());
            }
        };

        match status.status {
            ExecutionStatus::InProgress => {
                tracing::debug!(attempt, "attempt still in progress");
                self.keep_attempt_settled(&record, attempt, now)?;
                report.waiting += 1;
            }
            ExecutionStatus::Succeeded => {
                self.resolve_via_attempt(&record, attempt, now)?;
                report.resolved += 1;
            }
            ExecutionStatus::Failed => {
                // its failed-list entry stays visible for the whole fetch window
                self.keep_attempt_settled(&record, attempt, now)?;
                let remaining = policy::consume(record.retry_count);
                let mut update = RecordUpdate::new()
                    .retry_count(remaining)
                    .status(RecordStatus::Pending);
                if let Some(message) = status
                    .message
                    .as_deref()
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                {
                    update = update.last_error(message);
                }
                self.store
                    .update(&record.pipeline_name, &record.original_run_id, &update)?;
                update.apply_to(&mut record);
                tracing::info!(attempt, remaining, "remediation attempt failed");

                if policy::has_budget(remaining) {
                    report.requeued += 1;
                } else {
                    self.escalate(&record, EscalationReason::BudgetExhausted, None, now, report)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn evaluate_pending(
        &self,
        mut record: RunRecord,
        failure: Option<&FailedRun>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        if !policy::has_budget(record.retry_count) {
            return self
                .escalate(&record, EscalationReason::BudgetExhausted, None, now, report)
                .await;
        }
        if record.notified {
            tracing::debug!("record already notified, classifier not consulted");
            report.suppressed += 1;
            return Ok(());
        }

        let error_text = failure
            .map(|f| f.error_text.trim())
            .filter(|e| !e.is_empty())
            .or(record.last_error.as_deref())
            .unwrap_or(NO_ERROR_MESSAGE)
            .to_string();
        let step = failure.and_then(|f| f.failed_step.clone());

        let (classification, verdict) = match self
            .bounded(
                "classify",
                self.ports
                    .classifier
                    .classify(&record.pipeline_name, step.as_deref(), &error_text),
            )
            .await
        {
            Ok(classification) => {
                let verdict = policy::judge(&classification, &self.config.unrecoverable);
                (classification, verdict)
            }
            Err(e) => {
                tracing::warn!(error = %e, "classifier unavailable, escalating");
                (
                    Classification::new(
                        RemediationAction::None,
                        format!("error: failure could not be classified ({e})"),
                    ),
                    Verdict::Escalate(EscalationReason::ClassifierFailed(e.to_string())),
                )
            }
        };
        tracing::info!(
            action = %classification.action,
            rationale = %classification.rationale,
            "failure classified"
        );

        match verdict {
            Verdict::Remediate(kind) => {
                self.remediate(record, kind, step.as_deref(), &classification, now, report)
                    .await
            }
            Verdict::Escalate(reason) => {
                self.freeze(&mut record)?;
                self.escalate(&record, reason, Some(&classification), now, report)
                    .await
            }
        }
    }

    async fn remediate(
        &self,
        mut record: RunRecord,
        kind: RerunKind,
        step: Option<&str>,
        classification: &Classification,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        let request =
            policy::rerun_request(kind, &record.pipeline_name, &record.original_run_id, step);
        if kind == RerunKind::Partial && request.step().is_none() {
            tracing::info!("partial rerun requested without a known step, rerunning in full");
        }

        let started = self
            .bounded("trigger-rerun", self.ports.executor.trigger(&request))
            .await
            .and_then(|receipt| {
                receipt.run_id().map(str::to_string).ok_or_else(|| {
                    PortError::Malformed("rerun response carried no run id".to_string())
                })
            });

        match started {
            Ok(new_run_id) => {
                let update = RecordUpdate::new()
                    .last_attempt_run_id(&new_run_id)
                    .status(RecordStatus::Running);
                self.store
                    .update(&record.pipeline_name, &record.original_run_id, &update)?;
                if new_run_id != record.original_run_id {
                    self.store.mark_settled(
                        &record.pipeline_name,
                        &new_run_id,
                        SettledReason::Attempt,
                        now,
                    )?;
                }
                tracing::info!(attempt = %new_run_id, step = ?request.step(), "rerun started");
                report.triggered += 1;

                if self.config.notify_on_rerun {
                    let notice = rerun_notice(classification, &request, &new_run_id);
                    if let Err(e) = self
                        .bounded("notify", self.ports.notifier.notify(&notice))
                        .await
                    {
                        tracing::warn!(error = %e, "rerun notice not delivered");
                    }
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "rerun could not be started, escalating");
                self.freeze(&mut record)?;
                self.escalate(
                    &record,
                    EscalationReason::TriggerFailed(e.to_string()),
                    Some(classification),
                    now,
                    report,
                )
                .await
            }
        }
    }

    /// Budget to zero: no further remediation for this record
    fn freeze(&self, record: &mut RunRecord) -> Result<(), StoreError> {
        let update = RecordUpdate::new().retry_count(0);
        self.store
            .update(&record.pipeline_name, &record.original_run_id, &update)?;
        update.apply_to(record);
        Ok(())
    }

    /// The single notify path for terminal events, gated by `notified`
    async fn escalate(
        &self,
        record: &RunRecord,
        reason: EscalationReason,
        classification: Option<&Classification>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        if record.notified {
            tracing::debug!(%reason, "escalation already notified");
            report.suppressed += 1;
            return Ok(());
        }

        let rationale = classification
            .map(|c| c.rationale.as_str())
            .or(record.last_error.as_deref())
            .unwrap_or_default();
        let solution = if rationale.is_empty() {
            None
        } else {
            match self
                .bounded("lookup-solution", self.ports.solutions.lookup(rationale))
                .await
            {
                Ok(solution) => solution,
                Err(e) => {
                    tracing::warn!(error = %e, "solution lookup failed");
                    None
                }
            }
        };

        let notice = escalation_notice(&Escalation {
            record,
            reason: &reason,
            classification,
            solution: solution.as_deref(),
        });

        match self
            .bounded("notify", self.ports.notifier.notify(&notice))
            .await
        {
            Ok(()) => {
                self.store.update(
                    &record.pipeline_name,
                    &record.original_run_id,
                    &RecordUpdate::new().notified_at(now),
                )?;
                tracing::warn!(%reason, retry_count = record.retry_count, "escalated to operator");
                report.escalated += 1;
            }
            Err(e) => {
                tracing::error!(%reason, error = %e, "escalation notice failed, retrying next tick");
                report.notify_failures += 1;
            }
        }
        Ok(())
    }

    /// An attempt in flight must outlive ledger retention, however long it runs
    fn keep_attempt_settled(
        &self,
        record: &RunRecord,
        attempt: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if attempt == record.original_run_id {
            return Ok(());
        }
        self.store
            .mark_settled(&record.pipeline_name, attempt, SettledReason::Attempt, now)
    }

    fn resolve_via_attempt(
        &self,
        record: &RunRecord,
        attempt: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store
            .delete(&record.pipeline_name, &record.original_run_id)?;
        self.store.mark_settled(
            &record.pipeline_name,
            &record.original_run_id,
            SettledReason::Resolved,
            now,
        )?;
        tracing::info!(
            pipeline = %record.pipeline_name,
            run_id = %record.original_run_id,
            attempt,
            "remediation succeeded, tracking reset"
        );
        Ok(())
    }

    async fn bounded<T, F>(&self, what: &'static str, call: F) -> Result<T, PortError>
    where
        F: Future<Output = Result<T, PortError>>,
    {
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PortError::Timeout {
                what,
                secs: self.config.call_timeout.as_secs(),
            }),
        }
    }
}

fn record_span(record: &RunRecord) -> tracing::Span {
    tracing::info_span!(
        "record",
        pipeline = %record.pipeline_name,
        run_id = %record.original_run_id
    )
}
