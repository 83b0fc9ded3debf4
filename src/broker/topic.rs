//! Topic management
//!
//! A `Topic` holds the sender allow-list and the ordered list of subscriber
//! endpoints for one channel. Insertion order of `subscriptions` is delivery
//! order, and a URL appears at most once per topic.
//!
//! Everything here is pure data manipulation; persisting a changed topic is
//! the job of [`TopicRegistry`](super::registry::TopicRegistry).

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::BrokerError;

/// A single subscriber endpoint registered against a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Subscription {
    pub url: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_successful_delivery: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failed_delivery: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_deliveries: u64,
}

impl Subscription {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            created_at: Utc::now(),
            last_successful_delivery: None,
            last_failed_delivery: None,
            failed_deliveries: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Topic {
    pub identifier: String,
    #[serde(default)]
    pub allowed_senders: BTreeSet<String>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

/// Trims and upper-cases a topic identifier.
pub fn normalize_identifier(identifier: &str) -> String {
    identifier.trim().to_uppercase()
}

impl Topic {
    /// Create a new topic. The identifier is normalized but not validated.
    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: normalize_identifier(identifier),
            allowed_senders: BTreeSet::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Builder-style helper to allow a sender.
    pub fn allow_sender(mut self, sender: impl Into<String>) -> Self {
        self.allowed_senders.insert(sender.into());
        self
    }

    /// Normalizes the identifier in place and rejects an empty one.
    /// Repeated subscription URLs collapse onto their first entry.
    pub fn validate(&mut self) -> Result<(), BrokerError> {
        self.identifier = normalize_identifier(&self.identifier);
        if self.identifier.is_empty() {
            return Err(BrokerError::Validation(
                "topic identifier can't be empty".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        self.subscriptions.retain(|s| seen.insert(s.url.clone()));
        Ok(())
    }

    pub fn is_sender_allowed(&self, sender: &str) -> bool {
        self.allowed_senders.contains(sender)
    }

    pub fn is_subscribed(&self, url: &str) -> bool {
        self.subscriptions.iter().any(|s| s.url == url)
    }

    /// Appends a subscription for `url`. Returns `false` without changing
    /// anything if the URL is already subscribed.
    pub fn add_subscription(&mut self, url: &str) -> bool {
        if self.is_subscribed(url) {
            return false;
        }
        self.subscriptions.push(Subscription::new(url));
        true
    }

    /// Removes every subscription matching `url` and returns how many went.
    pub fn remove_subscription(&mut self, url: &str) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.url != url);
        before - self.subscriptions.len()
    }

    /// Snapshot of subscriber URLs in delivery order.
    pub fn subscriber_urls(&self) -> Vec<String> {
        self.subscriptions.iter().map(|s| s.url.clone()).collect()
    }

    pub(crate) fn subscription_mut(&mut self, url: &str) -> Option<&mut Subscription> {
        self.subscriptions.iter_mut().find(|s| s.url == url)
    }
}
