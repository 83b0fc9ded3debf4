//! Durable queue store backed by `sled`
//!
//! Layout:
//! - `topics`: one JSON document per topic, keyed by identifier
//! - `messages.new`, `messages.failed`, `messages.done`: one JSON document
//!   per message, keyed by message id; the tree a record lives in always
//!   matches the record's own `state` field
//!
//! Every mutation is serialized through one store-wide write lock and flushed
//! before returning. Moving a message between states is a single multi-tree
//! sled transaction, so readers and crash recovery see it in exactly one
//! container. Reads do not take the lock.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use tracing::{debug, warn};

use crate::broker::message::{Message, MessageState};
use crate::broker::topic::Topic;
use crate::utils::StorageError;

const TOPICS_TREE: &str = "topics";

pub struct QueueStore {
    pub(super) db: Db,
    topics: Tree,
    new_messages: Tree,
    failed_messages: Tree,
    done_messages: Tree,
    write_lock: Mutex<()>,
}

impl QueueStore {
    /// Open or create the store under `path`, creating every container.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> Result<Self, StorageError> {
        Ok(Self {
            topics: db.open_tree(TOPICS_TREE)?,
            new_messages: db.open_tree(container_name(MessageState::New))?,
            failed_messages: db.open_tree(container_name(MessageState::Failed))?,
            done_messages: db.open_tree(container_name(MessageState::Done))?,
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn tree(&self, state: MessageState) -> &Tree {
        match state {
            MessageState::New => &self.new_messages,
            MessageState::Failed => &self.failed_messages,
            MessageState::Done => &self.done_messages,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ----- topics -----

    /// Load a topic. Returns `None` if it does not exist.
    pub fn get_topic(&self, identifier: &str) -> Result<Option<Topic>, StorageError> {
        get_document(&self.topics, identifier)
    }

    pub fn save_topic(&self, topic: &Topic) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(topic)?;
        let _guard = self.lock();
        self.topics.insert(topic.identifier.as_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    /// Delete a topic. Returns whether a record was removed.
    pub fn delete_topic(&self, topic: &Topic) -> Result<bool, StorageError> {
        let _guard = self.lock();
        let removed = self.topics.remove(topic.identifier.as_bytes())?;
        self.db.flush()?;
        Ok(removed.is_some())
    }

    pub fn list_topics(&self) -> Result<Vec<Topic>, StorageError> {
        list_documents(&self.topics, TOPICS_TREE)
    }

    // ----- messages -----

    /// Write `message` into the `new` container if `is_new`, otherwise into
    /// `failed`. The record's `state` is updated to match.
    pub fn save_message(&self, message: &mut Message, is_new: bool) -> Result<(), StorageError> {
        message.state = MessageState::pending(is_new);
        let bytes = serde_json::to_vec(message)?;
        let _guard = self.lock();
        self.tree(message.state)
            .insert(message.id.as_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    /// Rewrite an existing pending record of `message` in `new` (if
    /// `is_new`) or `failed`.
    ///
    /// Unlike [`save_message`](Self::save_message) this never creates a
    /// record: if the message was purged meanwhile it fails with
    /// [`StorageError::MissingRecord`] and leaves the container untouched.
    pub fn update_message(&self, message: &mut Message, is_new: bool) -> Result<(), StorageError> {
        let state = MessageState::pending(is_new);
        let previous = message.state;
        message.state = state;
        let bytes = match serde_json::to_vec(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                message.state = previous;
                return Err(e.into());
            }
        };

        let _guard = self.lock();
        if let Err(e) = self.move_in_place(state, &message.id, bytes) {
            message.state = previous;
            return Err(e);
        }
        self.db.flush()?;
        Ok(())
    }

    /// Relocate `message` from `new` (if `was_new`) or `failed` into `done`
    /// (if `is_done`) or `failed`, writing its current contents.
    ///
    /// Fails with [`StorageError::MissingRecord`] if the source container
    /// holds no record for the message.
    pub fn move_message(
        &self,
        message: &mut Message,
        was_new: bool,
        is_done: bool,
    ) -> Result<(), StorageError> {
        let from = MessageState::pending(was_new);
        let to = MessageState::settled(is_done);
        let previous = message.state;
        message.state = to;
        let bytes = match serde_json::to_vec(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                message.state = previous;
                return Err(e.into());
            }
        };

        let _guard = self.lock();
        let result = if from == to {
            self.move_in_place(from, &message.id, bytes)
        } else {
            self.move_across(from, to, &message.id, bytes)
        };
        if result.is_err() {
            message.state = previous;
        }
        result?;
        self.db.flush()?;
        debug!(message_id = %message.id, %from, %to, "message moved");
        Ok(())
    }

    fn move_in_place(
        &self,
        state: MessageState,
        id: &str,
        bytes: Vec<u8>,
    ) -> Result<(), StorageError> {
        let tree = self.tree(state);
        if !tree.contains_key(id.as_bytes())? {
            return Err(missing(state, id));
        }
        tree.insert(id.as_bytes(), bytes)?;
        Ok(())
    }

    fn move_across(
        &self,
        from: MessageState,
        to: MessageState,
        id: &str,
        bytes: Vec<u8>,
    ) -> Result<(), StorageError> {
        let result = (self.tree(from), self.tree(to)).transaction(|(src, dst)| {
            if src.remove(id.as_bytes())?.is_none() {
                return Err(ConflictableTransactionError::Abort(()));
            }
            dst.insert(id.as_bytes(), bytes.clone())?;
            Ok(())
        });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(())) => Err(missing(from, id)),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    /// Messages in `new` (if `is_new`) or `failed`, ordered by id.
    pub fn list_messages(&self, is_new: bool) -> Result<Vec<Message>, StorageError> {
        self.list_messages_in(MessageState::pending(is_new))
    }

    pub fn list_messages_in(&self, state: MessageState) -> Result<Vec<Message>, StorageError> {
        list_documents(self.tree(state), container_name(state))
    }

    pub fn get_message(&self, id: &str, is_new: bool) -> Result<Option<Message>, StorageError> {
        self.get_message_in(id, MessageState::pending(is_new))
    }

    pub fn get_message_in(
        &self,
        id: &str,
        state: MessageState,
    ) -> Result<Option<Message>, StorageError> {
        get_document(self.tree(state), id)
    }

    /// Look a message up in every container.
    pub fn find_message(&self, id: &str) -> Result<Option<Message>, StorageError> {
        for state in MessageState::ALL {
            if let Some(message) = self.get_message_in(id, state)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    pub fn count_messages(&self, state: MessageState) -> usize {
        self.tree(state).len()
    }

    /// Remove a message from whichever container holds it. Returns the state
    /// it was removed from.
    pub fn purge_message(&self, id: &str) -> Result<Option<MessageState>, StorageError> {
        let _guard = self.lock();
        for state in MessageState::ALL {
            if self.tree(state).remove(id.as_bytes())?.is_some() {
                self.db.flush()?;
                return Ok(Some(state));
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("db", &"sled::Db")
            .finish()
    }
}

pub(crate) fn container_name(state: MessageState) -> &'static str {
    match state {
        MessageState::New => "messages.new",
        MessageState::Failed => "messages.failed",
        MessageState::Done => "messages.done",
    }
}

fn missing(state: MessageState, id: &str) -> StorageError {
    StorageError::MissingRecord {
        container: container_name(state),
        id: id.to_string(),
    }
}

fn get_document<T: DeserializeOwned>(tree: &Tree, key: &str) -> Result<Option<T>, StorageError> {
    match tree.get(key.as_bytes())? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Decodes every document in `tree`. Undecodable records are logged and
/// skipped so one corrupt file cannot hide the rest of the container.
fn list_documents<T: DeserializeOwned>(
    tree: &Tree,
    container: &str,
) -> Result<Vec<T>, StorageError> {
    let mut documents = Vec::with_capacity(tree.len());
    for entry in tree.iter() {
        let (key, bytes) = entry?;
        match serde_json::from_slice(&bytes) {
            Ok(doc) => documents.push(doc),
            Err(e) => warn!(
                container,
                key = %String::from_utf8_lossy(&key),
                error = %e,
                "skipping undecodable record"
            ),
        }
    }
    Ok(documents)
}
