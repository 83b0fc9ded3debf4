//! # durapub
//!
//! `durapub` is the durable publish/delivery engine of a topic-based message
//! broker. A message published to a topic is fanned out to every subscriber
//! endpoint over HTTP, its per-subscriber outcome is tracked, its durability
//! state survives a crash, and undelivered messages are retried on a fixed
//! schedule until every subscriber has acknowledged them.
//!
//! ## Core Modules
//!
//! - `broker`: topics, messages, the publisher, delivery attempts and the retry loop.
//! - `config`: loads settings from `config/default` and the environment.
//! - `persistence`: the `sled`-backed durable queue store.
//! - `transport`: outbound HTTP delivery to subscriber endpoints.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;

pub use broker::Broker;
pub use utils::BrokerError;
