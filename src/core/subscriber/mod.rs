//! Subscriber engine.
#[allow(clippy::module_inception)]
pub mod subscriber;

pub use subscriber::{SubscriberPool, SubscriberTimings, TopicCounter, SUBSCRIBE_QOS};
