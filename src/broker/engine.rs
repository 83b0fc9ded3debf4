//! Broker engine
//!
//! `Broker` wires the durable store, topic registry, delivery workers and
//! retry scheduler together and is the value the surrounding service passes
//! around; there is no global state.
//!
//! Lifecycle:
//! - [`Broker::new`] starts the delivery workers and resubmits messages left
//!   in `new` by a previous run
//! - [`Broker::spawn_retry_scheduler`] starts the background retry loop
//! - [`Broker::shutdown`] stops both, letting running attempts finish;
//!   [`Broker::drain`] first works off everything already queued

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::delivery::{Dispatcher, InFlight};
use super::message::Message;
use super::publisher::{PublishOutcome, Publisher};
use super::registry::TopicRegistry;
use super::retry::{RetryReport, RetryScheduler};
use crate::config::{DeliverySettings, Settings};
use crate::persistence::QueueStore;
use crate::transport::{Deliver, HttpDeliverer};
use crate::utils::BrokerError;

#[derive(Debug)]
pub struct Broker {
    store: Arc<QueueStore>,
    registry: Arc<TopicRegistry>,
    dispatcher: Arc<Dispatcher>,
    publisher: Publisher,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    retry_interval: Duration,
    grace: Duration,
}

impl Broker {
    /// Opens the store under `settings.store.data_dir` and starts delivering
    /// over HTTP, retry scheduler included. Failing to open the store is
    /// fatal for startup.
    pub fn start(settings: &Settings) -> Result<Self, BrokerError> {
        let store = Arc::new(QueueStore::open(&settings.store.data_dir)?);
        let deliverer = Arc::new(HttpDeliverer::from_settings(&settings.delivery)?);
        let broker = Self::new(store, deliverer, &settings.delivery)?;
        broker.spawn_retry_scheduler();
        Ok(broker)
    }

    /// Starts delivery workers over the given store and deliverer and
    /// resubmits pending messages. Does not start the retry scheduler.
    pub fn new(
        store: Arc<QueueStore>,
        deliverer: Arc<dyn Deliver>,
        settings: &DeliverySettings,
    ) -> Result<Self, BrokerError> {
        let registry = Arc::new(TopicRegistry::new(store.clone()));
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), registry.clone(), deliverer));
        let shutdown = CancellationToken::new();
        let publisher = Publisher::start(
            dispatcher.clone(),
            store.clone(),
            settings,
            shutdown.clone(),
        );
        publisher.recover_pending()?;

        Ok(Self {
            store,
            registry,
            dispatcher,
            publisher,
            scheduler: Mutex::new(None),
            shutdown,
            retry_interval: Duration::from_secs(settings.retry_interval_secs),
            grace: Duration::from_secs(settings.shutdown_grace_secs),
        })
    }

    pub fn store(&self) -> &Arc<QueueStore> {
        &self.store
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Message ids with a delivery attempt running right now.
    pub fn in_flight(&self) -> &InFlight {
        self.dispatcher.in_flight()
    }

    fn retry_scheduler(&self) -> RetryScheduler {
        RetryScheduler::new(self.dispatcher.clone(), self.store.clone(), self.retry_interval)
    }

    /// Starts the background retry loop. Calling it twice is a no-op.
    pub fn spawn_retry_scheduler(&self) {
        let mut slot = self
            .scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(self.retry_scheduler().spawn(self.shutdown.clone()));
        }
    }

    /// Runs one retry cycle right away, independent of the background loop.
    pub async fn retry_now(&self) -> RetryReport {
        self.retry_scheduler().run_cycle(&self.shutdown).await
    }

    /// Publishes `payload` to the topic `identifier` on behalf of `sender`.
    pub fn publish(
        &self,
        identifier: &str,
        payload: Value,
        sender: &str,
    ) -> Result<PublishOutcome, BrokerError> {
        let topic = self.registry.get_topic(identifier)?;
        if !topic.is_sender_allowed(sender) {
            return Err(BrokerError::SenderNotAllowed {
                sender: sender.to_string(),
                topic: topic.identifier,
            });
        }
        self.publisher.publish(payload, &topic, sender)
    }

    /// Looks a message up in whichever container holds it.
    pub fn message(&self, id: &str) -> Result<Message, BrokerError> {
        load_message(&self.store, id)
    }

    /// Finishes every queued first attempt, then shuts down.
    pub async fn drain(self) {
        self.publisher.close();
        self.publisher.join(self.grace).await;
        self.shutdown().await;
    }

    /// Stops the retry loop and the delivery workers. Attempts already
    /// running may finish within the grace period; queued messages stay in
    /// `new` for the next start.
    pub async fn shutdown(self) {
        info!("shutting down broker");
        self.shutdown.cancel();
        self.publisher.close();

        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = scheduler {
            if tokio::time::timeout(self.grace, handle).await.is_err() {
                warn!("retry scheduler did not stop within grace period");
            }
        }
        self.publisher.join(self.grace).await;
        info!(in_flight = self.dispatcher.in_flight().len(), "broker stopped");
    }
}

/// Loads message `id` from any container; an unknown id is
/// [`BrokerError::NotFound`].
pub fn load_message(store: &QueueStore, id: &str) -> Result<Message, BrokerError> {
    store
        .find_message(id)?
        .ok_or_else(|| BrokerError::message_not_found(id))
}
