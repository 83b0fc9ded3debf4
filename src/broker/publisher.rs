//! Publisher
//!
//! `publish` persists a new message into `new` and hands it to a bounded
//! pool of delivery workers, returning as soon as the message is durable.
//! The caller gets an acknowledgment of acceptance, never of delivery.
//!
//! ```text
//! publish() ──► save(new) ──► [bounded queue] ──► worker 1..N ──► attempt_delivery(first)
//!                                  │ full
//!                                  └──► move(new → failed), picked up by the retry scheduler
//! ```
//!
//! On shutdown the workers finish the attempt they are running and stop.
//! Messages still queued stay in `new` and are resubmitted by
//! [`Publisher::recover_pending`] on the next start.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::delivery::Dispatcher;
use super::message::Message;
use super::topic::Topic;
use crate::config::DeliverySettings;
use crate::persistence::QueueStore;
use crate::utils::BrokerError;

/// Result of [`Publisher::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The topic has no subscribers; no message was created.
    NoSubscribers,
    /// The message is durable in `new` and queued for delivery.
    Accepted {
        message_id: String,
        subscribers: usize,
    },
}

impl PublishOutcome {
    /// Message id, or an empty string when nothing was published.
    pub fn message_id(&self) -> &str {
        match self {
            Self::NoSubscribers => "",
            Self::Accepted { message_id, .. } => message_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        match self {
            Self::NoSubscribers => 0,
            Self::Accepted { subscribers, .. } => *subscribers,
        }
    }
}

pub struct Publisher {
    store: Arc<QueueStore>,
    queue: Mutex<Option<mpsc::Sender<Message>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Publisher {
    /// Spawns the worker pool. Must be called inside a tokio runtime.
    pub fn start(
        dispatcher: Arc<Dispatcher>,
        store: Arc<QueueStore>,
        settings: &DeliverySettings,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Message>(settings.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..settings.workers.max(1))
            .map(|index| {
                tokio::spawn(run_worker(
                    index,
                    dispatcher.clone(),
                    rx.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        Self {
            store,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            shutdown,
        }
    }

    fn queue(&self) -> MutexGuard<'_, Option<mpsc::Sender<Message>>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accepts `payload` for every current subscriber of `topic`.
    ///
    /// The delivery set is the topic's subscriber list at call time.
    pub fn publish(
        &self,
        payload: Value,
        topic: &Topic,
        sender: &str,
    ) -> Result<PublishOutcome, BrokerError> {
        if self.shutdown.is_cancelled() || self.queue().is_none() {
            return Err(BrokerError::ShuttingDown);
        }
        if topic.subscriptions.is_empty() {
            info!(topic = %topic.identifier, sender, "topic has no subscribers, message not processed");
            return Ok(PublishOutcome::NoSubscribers);
        }

        let mut message = Message::for_topic(topic, sender, payload);
        self.store.save_message(&mut message, true)?;

        let outcome = PublishOutcome::Accepted {
            message_id: message.id.clone(),
            subscribers: message.deliveries.len(),
        };
        info!(
            message_id = %message.id,
            topic = %topic.identifier,
            sender,
            subscribers = message.deliveries.len(),
            "message accepted"
        );
        self.enqueue(message);
        Ok(outcome)
    }

    /// Resubmits every message left in `new`, e.g. after a crash during its
    /// first attempt. Returns how many were found.
    pub fn recover_pending(&self) -> Result<usize, BrokerError> {
        let pending = self.store.list_messages(true)?;
        let count = pending.len();
        if count > 0 {
            info!(count, "resubmitting messages left in new");
        }
        for message in pending {
            self.enqueue(message);
        }
        Ok(count)
    }

    fn enqueue(&self, message: Message) {
        let sender = self.queue().clone();
        let Some(sender) = sender else {
            warn!(message_id = %message.id, "publisher closed, message stays in new");
            return;
        };

        match sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(mut message)) => {
                warn!(message_id = %message.id, "delivery queue full, deferring to retry");
                if let Err(e) = self.store.move_message(&mut message, true, false) {
                    error!(message_id = %message.id, error = %e, "could not defer message");
                }
            }
            Err(TrySendError::Closed(message)) => {
                warn!(message_id = %message.id, "delivery workers stopped, message stays in new");
            }
        }
    }

    /// Stops accepting work and lets the workers drain the queue.
    pub fn close(&self) {
        self.queue().take();
    }

    /// Waits for every worker to exit, up to `grace`.
    pub async fn join(&self, grace: Duration) {
        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let all = futures::future::join_all(workers);
        if tokio::time::timeout(grace, all).await.is_err() {
            warn!(?grace, "delivery workers still busy after grace period");
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("open", &self.queue().is_some())
            .finish()
    }
}

async fn run_worker(
    index: usize,
    dispatcher: Arc<Dispatcher>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>,
    shutdown: CancellationToken,
) {
    debug!(worker = index, "delivery worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            message = async { queue.lock().await.recv().await } => message,
        };
        let Some(message) = next else { break };

        let message_id = message.id.clone();
        let attempt = AssertUnwindSafe(dispatcher.attempt_delivery(message, true));
        if let Err(panic) = attempt.catch_unwind().await {
            error!(
                worker = index,
                message_id = %message_id,
                panic = %panic_message(panic.as_ref()),
                "delivery attempt panicked"
            );
        }
    }
    debug!(worker = index, "delivery worker stopped");
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
