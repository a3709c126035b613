//! Medic Core - retry state machine for failed pipeline runs
//!
//! Watches an orchestration service for failed runs and, per run:
//! - Tracks a retry budget in a durable store
//! - Asks a classifier whether a rerun could help
//! - Starts full or partial reruns and watches them
//! - Escalates to a human exactly once when automation gives up
//!
//! # Example
//!
//! ```rust,ignore
//! use medic_core::{Collaborators, Monitor, ReconcileConfig, Reconciler, SqliteRetryStore};
//!
//! # async fn example(ports: Collaborators) -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteRetryStore::open("pipeline_monitor.db")?;
//! let reconciler = Reconciler::new(store, ports, ReconcileConfig::new());
//!
//! let report = reconciler.tick().await?;
//! println!("started {} reruns", report.triggered);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod error;
pub mod monitor;
pub mod notice;
pub mod policy;
pub mod ports;
pub mod reconcile;
pub mod store;
pub mod types;

pub use error::{PortError, StoreError};
pub use monitor::{shutdown_channel, Monitor};
pub use notice::{escalation_notice, rerun_notice, Escalation, NO_DOCUMENTED_SOLUTION};
pub use policy::{
    consume, has_budget, judge, rerun_request, EscalationReason, RerunKind, UnrecoverableRule,
    Verdict, DEFAULT_INITIAL_BUDGET, DEFAULT_UNRECOVERABLE_MARKER,
};
pub use ports::{
    FailureClassifier, NoSolutionLookup, Notifier, RemediationExecutor, RunStatusSource,
    SolutionLookup,
};
pub use reconcile::{Collaborators, ReconcileConfig, Reconciler, TickReport, NO_ERROR_MESSAGE};
pub use store::{RetryStore, SqliteRetryStore};
pub use types::{
    Classification, ExecutionStatus, FailedRun, Notice, NoticeKind, RecordStatus, RecordUpdate,
    RemediationAction, RerunReceipt, RerunRequest, RunKey, RunRecord, SettledReason,
    StatusReport, SucceededRun,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for wiring a monitor
    pub use crate::{
        Collaborators, FailureClassifier, Monitor, Notifier, ReconcileConfig, Reconciler,
        RemediationExecutor, RetryStore, RunStatusSource, SqliteRetryStore,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
