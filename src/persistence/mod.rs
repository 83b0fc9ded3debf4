//! The `persistence` module provides the durable queue store.
//!
//! Topics and messages are kept in an embedded `sled` database. Each logical
//! container (topic definitions plus one container per message durability
//! state) is its own sled tree holding one JSON document per entity, keyed by
//! topic identifier or message id.

pub mod sled_store;

pub use sled_store::QueueStore;
