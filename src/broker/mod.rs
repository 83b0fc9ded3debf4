//! The `broker` module is the durable publish/delivery engine.
//!
//! - `topic` / `message`: the persisted data model
//! - `registry`: topic administration and subscribe/unsubscribe
//! - `publisher`: accepts messages and feeds the delivery worker pool
//! - `delivery`: one delivery attempt, shared by first attempts and retries
//! - `retry`: the periodic retry loop over failed messages
//! - `engine`: the `Broker` that ties them together

pub mod delivery;
pub mod engine;
pub mod message;
pub mod publisher;
pub mod registry;
pub mod retry;
pub mod topic;

pub use delivery::{AttemptOutcome, AttemptReport, Dispatcher, InFlight, SkipReason};
pub use engine::{Broker, load_message};
pub use message::{Delivery, Message, MessageState};
pub use publisher::{PublishOutcome, Publisher};
pub use registry::{DeliveryOutcome, SubscribeOutcome, TopicRegistry};
pub use retry::{RetryReport, RetryScheduler};
pub use topic::{Subscription, Topic};
