//! Retry scheduler
//!
//! One background loop for the lifetime of the process. Every interval
//! (five minutes by default, first cycle immediately) it lists the `failed`
//! container and re-attempts each message in turn. There is no backoff
//! growth, jitter or retry cap: a message is retried until it is delivered
//! or purged.
//!
//! A failing or panicking message never stops the loop or the rest of its
//! batch. Cancellation is checked between messages.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::delivery::{AttemptOutcome, Dispatcher};
use super::publisher::panic_message;
use crate::persistence::QueueStore;

/// Counts for one pass over the `failed` container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    /// Moved to `done` by this cycle.
    pub completed: usize,
    pub still_failed: usize,
    pub skipped: usize,
    pub panicked: usize,
}

#[derive(Debug)]
pub struct RetryScheduler {
    dispatcher: Arc<Dispatcher>,
    store: Arc<QueueStore>,
    interval: Duration,
}

impl RetryScheduler {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

    pub fn new(dispatcher: Arc<Dispatcher>, store: Arc<QueueStore>, interval: Duration) -> Self {
        Self {
            dispatcher,
            store,
            interval: if interval.is_zero() {
                Self::DEFAULT_INTERVAL
            } else {
                interval
            },
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "watching for failed messages to retry");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.run_cycle(&shutdown).await;
        }
        info!("retry scheduler stopped");
    }

    /// Re-attempts every message currently in `failed`, sequentially.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> RetryReport {
        let mut report = RetryReport::default();
        let messages = match self.store.list_messages(false) {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "could not load messages to retry");
                return report;
            }
        };
        info!(count = messages.len(), "retrying failed messages");

        for message in messages {
            if shutdown.is_cancelled() {
                break;
            }
            let message_id = message.id.clone();
            let attempt = AssertUnwindSafe(self.dispatcher.attempt_delivery(message, false));
            match attempt.catch_unwind().await {
                Ok(AttemptOutcome::Completed(attempt)) => {
                    report.attempted += 1;
                    if attempt.is_done() {
                        report.completed += 1;
                    } else {
                        report.still_failed += 1;
                    }
                }
                Ok(AttemptOutcome::Skipped(_)) => report.skipped += 1,
                Err(panic) => {
                    report.panicked += 1;
                    error!(
                        message_id = %message_id,
                        panic = %panic_message(panic.as_ref()),
                        "retry attempt panicked"
                    );
                }
            }
        }

        info!(
            attempted = report.attempted,
            completed = report.completed,
            still_failed = report.still_failed,
            skipped = report.skipped,
            "retry cycle finished"
        );
        report
    }
}
