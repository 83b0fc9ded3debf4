//! Message definitions for the delivery engine
//!
//! `Message` is the persisted record of one published payload together with
//! its per-subscriber delivery bookkeeping.
//!
//! Notes on fields:
//! - `id`: `{timestamp}-{topic}-{sender}-{uuid}`; the fixed-width RFC 3339
//!   timestamp prefix makes lexical order equal creation order
//! - `payload`: opaque JSON document, posted to subscribers verbatim
//! - `deliveries`: one entry per subscriber, fixed at publish time
//! - `state`: the durability state, always equal to the container the record
//!   is stored in

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::topic::Topic;

/// Durability state of a message. A record lives in exactly one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    /// Accepted, first attempt not yet finished.
    New,
    /// At least one delivery outstanding; eligible for retry.
    Failed,
    /// Every delivery succeeded. Terminal.
    Done,
}

impl MessageState {
    pub const ALL: [MessageState; 3] = [
        MessageState::New,
        MessageState::Failed,
        MessageState::Done,
    ];

    /// Container for a message that is still pending delivery.
    pub fn pending(is_new: bool) -> Self {
        if is_new { Self::New } else { Self::Failed }
    }

    /// Destination container after an attempt.
    pub fn settled(is_done: bool) -> Self {
        if is_done { Self::Done } else { Self::Failed }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Failed => "failed",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome record of handing one message to one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Delivery {
    pub subscription_url: String,
    pub delivered: bool,
    pub failed: bool,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl Delivery {
    pub fn new(subscription_url: impl Into<String>) -> Self {
        Self {
            subscription_url: subscription_url.into(),
            delivered: false,
            failed: false,
            delivered_at: None,
            failed_at: None,
        }
    }

    /// A success clears the failed flag; `failed_at` keeps the last failure.
    pub fn mark_delivered(&mut self, at: DateTime<Utc>) {
        self.delivered = true;
        self.failed = false;
        self.delivered_at = Some(at);
    }

    pub fn mark_failed(&mut self, at: DateTime<Utc>) {
        self.failed = true;
        self.failed_at = Some(at);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Message {
    pub id: String,
    #[serde(rename = "topic")]
    pub topic_identifier: String,
    pub sender: String,
    pub payload: Value,
    pub deliveries: Vec<Delivery>,
    pub created_at: DateTime<Utc>,
    pub state: MessageState,
}

impl Message {
    /// Builds a new message for `topic`, snapshotting its current subscribers.
    pub fn for_topic(topic: &Topic, sender: &str, payload: Value) -> Self {
        let created_at = Utc::now();
        Self {
            id: message_id(created_at, &topic.identifier, sender),
            topic_identifier: topic.identifier.clone(),
            sender: sender.to_string(),
            payload,
            deliveries: topic
                .subscriptions
                .iter()
                .map(|s| Delivery::new(s.url.clone()))
                .collect(),
            created_at,
            state: MessageState::New,
        }
    }

    pub fn is_fully_delivered(&self) -> bool {
        self.deliveries.iter().all(|d| d.delivered)
    }

    pub fn pending_deliveries(&self) -> usize {
        self.deliveries.iter().filter(|d| !d.delivered).count()
    }
}

/// Generates a globally unique, lexically sortable message id.
pub fn message_id(created_at: DateTime<Utc>, topic: &str, sender: &str) -> String {
    format!(
        "{}-{}-{}-{}",
        created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        topic,
        sender,
        Uuid::new_v4()
    )
}
