//! Error types shared by every layer of the engine.
//!
//! Storage and delivery failures have their own enums so the asynchronous
//! delivery path can log and continue on them, while the synchronous
//! registry/publish surface reports everything through [`BrokerError`].

use thiserror::Error;

/// Failure reading or writing the durable queue store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store I/O failed: {0}")]
    Sled(#[from] sled::Error),

    #[error("record could not be encoded or decoded: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("no record '{id}' in container '{container}'")]
    MissingRecord { container: &'static str, id: String },

    #[error("storage task did not finish: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Failure handing one message to one subscriber. Always recoverable.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("subscriber answered with status {0}")]
    Status(u16),
}

/// Errors surfaced synchronously to callers of the registry and publisher.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("sender '{sender}' is not allowed on topic '{topic}'")]
    SenderNotAllowed { sender: String, topic: String },

    #[error("topic '{0}' already exists")]
    TopicExists(String),

    #[error("broker is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("HTTP client could not be built: {0}")]
    Http(#[from] reqwest::Error),
}

impl BrokerError {
    pub(crate) fn topic_not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "topic",
            id: identifier.into(),
        }
    }

    pub(crate) fn message_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "message",
            id: id.into(),
        }
    }
}
