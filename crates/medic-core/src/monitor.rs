//! Polling driver around the reconciler

use crate::error::StoreError;
use crate::reconcile::{Reconciler, TickReport};
use crate::store::RetryStore;
use std::time::Duration;
use tokio::sync::watch;

/// Create the shutdown channel consumed by [`Monitor::run`]
#[must_use]
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Ticks the reconciler forever, sleeping `poll_interval` in between
#[derive(Debug)]
pub struct Monitor<S> {
    reconciler: Reconciler<S>,
    poll_interval: Duration,
}

impl<S: RetryStore> Monitor<S> {
    #[must_use]
    pub fn new(reconciler: Reconciler<S>, poll_interval: Duration) -> Self {
        Self {
            reconciler,
            poll_interval,
        }
    }

    #[inline]
    #[must_use]
    pub fn reconciler(&self) -> &Reconciler<S> {
        &self.reconciler
    }

    /// Run until shutdown is signalled; returns the number of completed ticks
    ///
    /// Shutdown is honoured between ticks only, so a tick in flight always
    /// finishes. Dropping the sender also stops the loop. A store failure
    /// ends the loop with the error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<u64, StoreError> {
        let mut ticks = 0u64;
        tracing::info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "monitor started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.reconciler.tick().await.map_err(|e| {
                tracing::error!(error = %e, "retry store failed, stopping monitor");
                e
            })?;
            ticks += 1;
            log_activity(ticks, &report);

            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(ticks, "monitor stopped");
        Ok(ticks)
    }
}

fn log_activity(tick: u64, report: &TickReport) {
    if report.escalated > 0 || report.notify_failures > 0 {
        tracing::warn!(
            tick,
            escalated = report.escalated,
            notify_failures = report.notify_failures,
            "tick needed operator attention"
        );
    } else {
        tracing::debug!(tick, "tick finished quietly");
    }
}
