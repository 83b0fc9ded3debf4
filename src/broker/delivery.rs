//! Delivery attempts
//!
//! [`Dispatcher::attempt_delivery`] is the one code path used for first
//! attempts and retries alike. It posts the payload to every outstanding
//! subscriber, persists the message after each recorded outcome and finally
//! settles the message into `done` or `failed`.
//!
//! Retries skip deliveries that already succeeded, so a subscriber that
//! acknowledged a message is never notified about it again.
//!
//! Only one attempt per message id runs at a time; see [`InFlight`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::task;
use tracing::{debug, error, info, warn};

use super::message::{Message, MessageState};
use super::registry::{DeliveryOutcome, TopicRegistry};
use crate::persistence::QueueStore;
use crate::transport::Deliver;
use crate::utils::StorageError;

/// Set of message ids with an attempt currently running.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    fn ids(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims `id`. Returns `None` if another attempt holds it.
    pub fn try_acquire(&self, id: &str) -> Option<FlightGuard> {
        if !self.ids().insert(id.to_string()) {
            return None;
        }
        Some(FlightGuard {
            ids: self.ids.clone(),
            id: id.to_string(),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids().contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its message id on drop, including on panic unwind.
#[derive(Debug)]
pub struct FlightGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

/// What one finished attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub message_id: String,
    /// Deliveries tried during this attempt.
    pub attempted: usize,
    /// Deliveries that failed during this attempt.
    pub failed: usize,
    /// Bookkeeping problems (encoding, storage) seen during this attempt.
    pub storage_errors: usize,
    /// State the message was left in.
    pub state: MessageState,
}

impl AttemptReport {
    pub fn is_done(&self) -> bool {
        self.state == MessageState::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another attempt for the same message is running.
    InFlight,
    /// The message is no longer in `failed` (finished or purged meanwhile).
    NotPending,
    /// The message was purged while the attempt ran; nothing was written
    /// back for it.
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed(AttemptReport),
    Skipped(SkipReason),
}

pub struct Dispatcher {
    store: Arc<QueueStore>,
    registry: Arc<TopicRegistry>,
    deliverer: Arc<dyn Deliver>,
    in_flight: InFlight,
}

impl Dispatcher {
    pub fn new(
        store: Arc<QueueStore>,
        registry: Arc<TopicRegistry>,
        deliverer: Arc<dyn Deliver>,
    ) -> Self {
        Self {
            store,
            registry,
            deliverer,
            in_flight: InFlight::default(),
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Runs one delivery attempt for `message`.
    ///
    /// `is_first_attempt` says which container the message sits in (`new`
    /// vs `failed`). Retries work on a fresh copy read from `failed` after
    /// the single-flight guard is taken.
    pub async fn attempt_delivery(&self, message: Message, is_first_attempt: bool) -> AttemptOutcome {
        let Some(_guard) = self.in_flight.try_acquire(&message.id) else {
            debug!(message_id = %message.id, "attempt already running, skipping");
            return AttemptOutcome::Skipped(SkipReason::InFlight);
        };

        let message = if is_first_attempt {
            message
        } else {
            match self.store.get_message(&message.id, false) {
                Ok(Some(fresh)) => fresh,
                Ok(None) => {
                    debug!(message_id = %message.id, "message left failed state, skipping");
                    return AttemptOutcome::Skipped(SkipReason::NotPending);
                }
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "could not reload message, using listed copy");
                    message
                }
            }
        };

        self.deliver_all(message, is_first_attempt).await
    }

    async fn deliver_all(&self, mut message: Message, is_first_attempt: bool) -> AttemptOutcome {
        info!(
            message_id = %message.id,
            first_attempt = is_first_attempt,
            pending = message.pending_deliveries(),
            "delivering message"
        );

        let mut attempted = 0;
        let mut failed = 0;
        let mut storage_errors = 0;

        match serde_json::to_vec(&message.payload) {
            Ok(body) => {
                for index in 0..message.deliveries.len() {
                    if !is_first_attempt && message.deliveries[index].delivered {
                        continue;
                    }
                    attempted += 1;

                    let url = message.deliveries[index].subscription_url.clone();
                    let result = self.deliverer.deliver(&url, &body).await;
                    let now = Utc::now();
                    let outcome = match result {
                        Ok(()) => {
                            info!(message_id = %message.id, url = %url, "delivered");
                            message.deliveries[index].mark_delivered(now);
                            DeliveryOutcome::Delivered(now)
                        }
                        Err(e) => {
                            warn!(message_id = %message.id, url = %url, error = %e, "delivery failed");
                            message.deliveries[index].mark_failed(now);
                            failed += 1;
                            DeliveryOutcome::Failed(now)
                        }
                    };
                    self.record_delivery(&message.topic_identifier, url, outcome)
                        .await;

                    match self
                        .persist(&mut message, Persist::Update { is_new: is_first_attempt })
                        .await
                    {
                        Ok(()) => {}
                        Err(StorageError::MissingRecord { .. }) => {
                            warn!(message_id = %message.id, "message removed during attempt, abandoning it");
                            return AttemptOutcome::Skipped(SkipReason::Removed);
                        }
                        Err(e) => {
                            error!(message_id = %message.id, error = %e, "could not persist delivery outcome");
                            storage_errors += 1;
                        }
                    }
                }
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "could not serialize payload");
                storage_errors += 1;
            }
        }

        let had_errors = failed > 0 || storage_errors > 0;
        if is_first_attempt || !had_errors {
            let is_done = message.is_fully_delivered();
            let step = Persist::Move {
                was_new: is_first_attempt,
                is_done,
            };
            match self.persist(&mut message, step).await {
                Ok(()) => {}
                Err(StorageError::MissingRecord { .. }) => {
                    warn!(message_id = %message.id, "message removed during attempt, abandoning it");
                    return AttemptOutcome::Skipped(SkipReason::Removed);
                }
                Err(e) => {
                    error!(message_id = %message.id, error = %e, "could not move message to its settled state");
                    storage_errors += 1;
                }
            }
        }

        info!(
            message_id = %message.id,
            state = %message.state,
            attempted,
            failed,
            "finished delivering message"
        );

        AttemptOutcome::Completed(AttemptReport {
            message_id: message.id,
            attempted,
            failed,
            storage_errors,
            state: message.state,
        })
    }

    /// Runs a store write on the blocking pool, since every write ends in a
    /// flush to disk. Only the resulting `state` is copied back.
    async fn persist(&self, message: &mut Message, step: Persist) -> Result<(), StorageError> {
        let store = Arc::clone(&self.store);
        let mut copy = message.clone();
        let state = task::spawn_blocking(move || {
            match step {
                Persist::Update { is_new } => store.update_message(&mut copy, is_new)?,
                Persist::Move { was_new, is_done } => {
                    store.move_message(&mut copy, was_new, is_done)?
                }
            }
            Ok::<_, StorageError>(copy.state)
        })
        .await??;
        message.state = state;
        Ok(())
    }

    async fn record_delivery(&self, identifier: &str, url: String, outcome: DeliveryOutcome) {
        let registry = Arc::clone(&self.registry);
        let identifier = identifier.to_string();
        let recorded =
            task::spawn_blocking(move || registry.record_delivery(&identifier, &url, outcome)).await;
        if let Err(e) = recorded {
            warn!(error = %e, "delivery stats task did not finish");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Persist {
    Update { is_new: bool },
    Move { was_new: bool, is_done: bool },
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
