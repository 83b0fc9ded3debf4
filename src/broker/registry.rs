//! Topic & subscription registry
//!
//! Owns topic definitions on top of the [`QueueStore`]. Every
//! read-modify-write of a topic (subscribe, unsubscribe, allow-list updates,
//! delivery statistics) runs under one registry lock so concurrent updates
//! cannot overwrite each other.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::topic::{Topic, normalize_identifier};
use crate::persistence::QueueStore;
use crate::utils::BrokerError;

/// Result of a successful [`TopicRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Added,
    AlreadySubscribed,
}

/// Outcome of one delivery, recorded on the matching subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(DateTime<Utc>),
    Failed(DateTime<Utc>),
}

#[derive(Debug)]
pub struct TopicRegistry {
    store: Arc<QueueStore>,
    update_lock: Mutex<()>,
}

impl TopicRegistry {
    pub fn new(store: Arc<QueueStore>) -> Self {
        Self {
            store,
            update_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.update_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validates and stores a new topic. Identifiers are unique.
    pub fn create_topic(&self, mut topic: Topic) -> Result<Topic, BrokerError> {
        topic.validate()?;
        let _guard = self.lock();
        if self.store.get_topic(&topic.identifier)?.is_some() {
            return Err(BrokerError::TopicExists(topic.identifier));
        }
        self.store.save_topic(&topic)?;
        info!(topic = %topic.identifier, "topic created");
        Ok(topic)
    }

    /// Load a topic by (unnormalized) identifier.
    pub fn get_topic(&self, identifier: &str) -> Result<Topic, BrokerError> {
        let identifier = normalize_identifier(identifier);
        self.store
            .get_topic(&identifier)?
            .ok_or_else(|| BrokerError::topic_not_found(identifier))
    }

    pub fn list_topics(&self) -> Result<Vec<Topic>, BrokerError> {
        Ok(self.store.list_topics()?)
    }

    pub fn delete_topic(&self, identifier: &str) -> Result<(), BrokerError> {
        let _guard = self.lock();
        let topic = self.get_topic(identifier)?;
        if !self.store.delete_topic(&topic)? {
            return Err(BrokerError::topic_not_found(topic.identifier));
        }
        info!(topic = %topic.identifier, "topic deleted");
        Ok(())
    }

    /// Replaces the sender allow-list of a topic.
    pub fn set_allowed_senders(
        &self,
        identifier: &str,
        senders: BTreeSet<String>,
    ) -> Result<Topic, BrokerError> {
        self.update(identifier, |topic| {
            topic.allowed_senders = senders;
            Ok(())
        })
    }

    /// Subscribes `url` to the topic on behalf of `sender`.
    ///
    /// Subscribing an already subscribed URL is a successful no-op.
    pub fn subscribe(
        &self,
        identifier: &str,
        url: &str,
        sender: &str,
    ) -> Result<SubscribeOutcome, BrokerError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(BrokerError::Validation(
                "subscription url can't be empty".to_string(),
            ));
        }

        let _guard = self.lock();
        let mut topic = self.get_topic(identifier)?;
        if !topic.is_sender_allowed(sender) {
            return Err(BrokerError::SenderNotAllowed {
                sender: sender.to_string(),
                topic: topic.identifier,
            });
        }
        if !topic.add_subscription(url) {
            debug!(topic = %topic.identifier, url, "already subscribed");
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }
        self.store.save_topic(&topic)?;
        info!(topic = %topic.identifier, url, "subscription added");
        Ok(SubscribeOutcome::Added)
    }

    /// Removes every subscription for `url`. Unknown URLs are not an error.
    pub fn unsubscribe(&self, identifier: &str, url: &str) -> Result<(), BrokerError> {
        let url = url.trim();
        self.update(identifier, |topic| {
            let removed = topic.remove_subscription(url);
            info!(topic = %topic.identifier, url, removed, "unsubscribed");
            Ok(())
        })
        .map(|_| ())
    }

    /// Best-effort bookkeeping of a delivery outcome on the subscription.
    /// The topic or subscription may be gone by now; that is only logged.
    pub fn record_delivery(&self, identifier: &str, url: &str, outcome: DeliveryOutcome) {
        let _guard = self.lock();
        let mut topic = match self.store.get_topic(identifier) {
            Ok(Some(topic)) => topic,
            Ok(None) => {
                debug!(topic = identifier, "topic gone, delivery stats not recorded");
                return;
            }
            Err(e) => {
                warn!(topic = identifier, error = %e, "could not load topic for delivery stats");
                return;
            }
        };
        let Some(subscription) = topic.subscription_mut(url) else {
            debug!(topic = identifier, url, "subscription gone, delivery stats not recorded");
            return;
        };
        match outcome {
            DeliveryOutcome::Delivered(at) => subscription.last_successful_delivery = Some(at),
            DeliveryOutcome::Failed(at) => {
                subscription.last_failed_delivery = Some(at);
                subscription.failed_deliveries += 1;
            }
        }
        if let Err(e) = self.store.save_topic(&topic) {
            warn!(topic = identifier, error = %e, "could not save delivery stats");
        }
    }

    fn update<F>(&self, identifier: &str, change: F) -> Result<Topic, BrokerError>
    where
        F: FnOnce(&mut Topic) -> Result<(), BrokerError>,
    {
        let _guard = self.lock();
        let mut topic = self.get_topic(identifier)?;
        change(&mut topic)?;
        self.store.save_topic(&topic)?;
        Ok(topic)
    }
}
