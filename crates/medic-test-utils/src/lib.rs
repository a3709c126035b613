//! Testing utilities for the Medic workspace
//!
//! Scripted stand-ins for every external collaborator, plus store
//! invariant assertions shared by the core and daemon test suites.

#![allow(missing_docs)]

use medic_core::{
    Classification, Collaborators, FailedRun, FailureClassifier, Notice, NoticeKind, Notifier,
    PortError, ReconcileConfig, Reconciler, RemediationAction, RemediationExecutor, RerunReceipt,
    RerunRequest, RetryStore, RunStatusSource, SolutionLookup, SqliteRetryStore, StatusReport,
    SucceededRun,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

async fn pause(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Default)]
struct SourceScript {
    failed: Vec<FailedRun>,
    succeeded: Vec<SucceededRun>,
    statuses: HashMap<String, StatusReport>,
    fetch_error: Option<PortError>,
    status_error: Option<PortError>,
    delay: Option<Duration>,
    status_calls: Vec<String>,
}

/// Run source whose answers are set by the test
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: Mutex<SourceScript>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failed(&self, runs: Vec<FailedRun>) {
        self.script.lock().failed = runs;
    }

    pub fn set_succeeded(&self, runs: Vec<SucceededRun>) {
        self.script.lock().succeeded = runs;
    }

    pub fn set_status(&self, run_id: &str, report: StatusReport) {
        self.script
            .lock()
            .statuses
            .insert(run_id.to_string(), report);
    }

    pub fn clear_status(&self, run_id: &str) {
        self.script.lock().statuses.remove(run_id);
    }

    /// Make both list fetches fail
    pub fn fail_fetches(&self, error: Option<PortError>) {
        self.script.lock().fetch_error = error;
    }

    pub fn fail_status(&self, error: Option<PortError>) {
        self.script.lock().status_error = error;
    }

    /// Delay every answer; pair with paused time to provoke timeouts
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.script.lock().delay = delay;
    }

    /// Run ids whose status was asked for, in order
    pub fn status_calls(&self) -> Vec<String> {
        self.script.lock().status_calls.clone()
    }
}

#[async_trait::async_trait]
impl RunStatusSource for ScriptedSource {
    async fn failed_runs(&self, _window: Duration) -> Result<Vec<FailedRun>, PortError> {
        let delay = self.script.lock().delay;
        pause(delay).await;
        let script = self.script.lock();
        match &script.fetch_error {
            Some(e) => Err(e.clone()),
            None => Ok(script.failed.clone()),
        }
    }

    async fn succeeded_runs(&self, _window: Duration) -> Result<Vec<SucceededRun>, PortError> {
        let delay = self.script.lock().delay;
        pause(delay).await;
        let script = self.script.lock();
        match &script.fetch_error {
            Some(e) => Err(e.clone()),
            None => Ok(script.succeeded.clone()),
        }
    }

    async fn run_status(&self, run_id: &str) -> Result<Option<StatusReport>, PortError> {
        let delay = {
            let mut script = self.script.lock();
            script.status_calls.push(run_id.to_string());
            script.delay
        };
        pause(delay).await;
        let script = self.script.lock();
        match &script.status_error {
            Some(e) => Err(e.clone()),
            None => Ok(script.statuses.get(run_id).cloned()),
        }
    }
}

/// One recorded classifier consultation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyCall {
    pub pipeline_name: String,
    pub failed_step: Option<String>,
    pub error_text: String,
}

/// Classifier returning a fixed answer and recording every call
#[derive(Debug)]
pub struct ScriptedClassifier {
    answer: Mutex<Result<Classification, PortError>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<ClassifyCall>>,
}

impl ScriptedClassifier {
    pub fn new(answer: Result<Classification, PortError>) -> Self {
        Self {
            answer: Mutex::new(answer),
            delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Classifier that always advises the given action
    pub fn always(action: RemediationAction, rationale: &str) -> Self {
        Self::new(Ok(Classification::new(action, rationale)))
    }

    pub fn set_answer(&self, answer: Result<Classification, PortError>) {
        *self.answer.lock() = answer;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<ClassifyCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Default for ScriptedClassifier {
    fn default() -> Self {
        Self::always(RemediationAction::Full, "full. transient connectivity error")
    }
}

#[async_trait::async_trait]
impl FailureClassifier for ScriptedClassifier {
    async fn classify(
        &self,
        pipeline_name: &str,
        failed_step: Option<&str>,
        error_text: &str,
    ) -> Result<Classification, PortError> {
        self.calls.lock().push(ClassifyCall {
            pipeline_name: pipeline_name.to_string(),
            failed_step: failed_step.map(str::to_string),
            error_text: error_text.to_string(),
        });
        let delay = *self.delay.lock();
        pause(delay).await;
        self.answer.lock().clone()
    }
}

/// Executor handing out `rerun-1`, `rerun-2`, ... unless told otherwise
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    answer: Mutex<Option<Result<RerunReceipt, PortError>>>,
    requests: Mutex<Vec<RerunRequest>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed answer for every trigger; `None` restores generated ids
    pub fn set_answer(&self, answer: Option<Result<RerunReceipt, PortError>>) {
        *self.answer.lock() = answer;
    }

    pub fn requests(&self) -> Vec<RerunRequest> {
        self.requests.lock().clone()
    }

    pub fn trigger_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait::async_trait]
impl RemediationExecutor for ScriptedExecutor {
    async fn trigger(&self, request: &RerunRequest) -> Result<RerunReceipt, PortError> {
        let mut requests = self.requests.lock();
        requests.push(request.clone());
        match &*self.answer.lock() {
            Some(answer) => answer.clone(),
            None => Ok(RerunReceipt::started(format!("rerun-{}", requests.len()))),
        }
    }
}

/// Notifier recording every delivered notice
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
    failure: Mutex<Option<PortError>>,
    attempts: Mutex<usize>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every notice while set
    pub fn fail_with(&self, error: Option<PortError>) {
        *self.failure.lock() = error;
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }

    pub fn escalations(&self) -> Vec<Notice> {
        self.notices_of(NoticeKind::Escalation)
    }

    pub fn reruns(&self) -> Vec<Notice> {
        self.notices_of(NoticeKind::Rerun)
    }

    /// Delivery attempts, accepted or not
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }

    fn notices_of(&self, kind: NoticeKind) -> Vec<Notice> {
        self.notices
            .lock()
            .iter()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &Notice) -> Result<(), PortError> {
        *self.attempts.lock() += 1;
        if let Some(e) = self.failure.lock().clone() {
            return Err(e);
        }
        self.notices.lock().push(notice.clone());
        Ok(())
    }
}

/// Knowledge base with one canned answer
#[derive(Debug, Default)]
pub struct FixedSolutions {
    answer: Mutex<Option<Result<String, PortError>>>,
    lookups: Mutex<Vec<String>>,
}

impl FixedSolutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_answer(&self, answer: Option<Result<String, PortError>>) {
        *self.answer.lock() = answer;
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().clone()
    }
}

#[async_trait::async_trait]
impl SolutionLookup for FixedSolutions {
    async fn lookup(&self, rationale: &str) -> Result<Option<String>, PortError> {
        self.lookups.lock().push(rationale.to_string());
        match self.answer.lock().clone() {
            Some(Ok(solution)) => Ok(Some(solution)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// All scripted collaborators of one test
#[derive(Debug, Clone)]
pub struct Harness {
    pub source: Arc<ScriptedSource>,
    pub classifier: Arc<ScriptedClassifier>,
    pub executor: Arc<ScriptedExecutor>,
    pub notifier: Arc<RecordingNotifier>,
    pub solutions: Arc<FixedSolutions>,
}

impl Default for Harness {
    fn default() -> Self {
        Self {
            source: Arc::new(ScriptedSource::new()),
            classifier: Arc::new(ScriptedClassifier::default()),
            executor: Arc::new(ScriptedExecutor::new()),
            notifier: Arc::new(RecordingNotifier::new()),
            solutions: Arc::new(FixedSolutions::new()),
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.source.clone(),
            self.classifier.clone(),
            self.executor.clone(),
            self.notifier.clone(),
        )
        .with_solutions(self.solutions.clone())
    }

    /// Reconciler over an in-memory store
    pub fn reconciler(&self, config: ReconcileConfig) -> Reconciler<SqliteRetryStore> {
        let store = SqliteRetryStore::open_in_memory().expect("in-memory store");
        Reconciler::new(store, self.collaborators(), config)
    }
}

/// Failed run with an error text
pub fn failed(pipeline: &str, run_id: &str, error: &str) -> FailedRun {
    FailedRun::new(pipeline, run_id, error)
}

pub fn succeeded(pipeline: &str, run_id: &str) -> SucceededRun {
    SucceededRun::new(pipeline, run_id)
}

/// Check the invariants every persisted record must hold
pub fn assert_store_invariants(store: &impl RetryStore) {
    let records = store.list().expect("list records");
    for record in &records {
        assert!(
            record.is_consistent(),
            "running record without attempt id: {}",
            record.key()
        );
        assert!(
            record.retry_count >= 0,
            "negative budget on {}: {}",
            record.key(),
            record.retry_count
        );
        assert_eq!(
            record.notified,
            record.last_notification_time.is_some(),
            "notified flag and time disagree on {}",
            record.key()
        );
    }
}
