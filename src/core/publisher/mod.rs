//! Publisher engine.
//! Ramps up a fleet of publisher identities and drives one send loop per
//! (publisher, topic) pair.
#[allow(clippy::module_inception)]
pub mod publisher;

pub use publisher::{jittered_delay, random_payload, PublisherPool, PAYLOAD_LEN};
