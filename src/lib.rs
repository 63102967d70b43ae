//! mqtt-loadtest – connection-churn and throughput load generator for MQTT
//! brokers.
//!
//! This crate exports
//!  * `core`    – naming, client seam, pools, publisher and subscriber engines
//!  * `config`  – CLI / TOML settings resolved into validated run configs
//!  * `metrics` – counter registry and its Prometheus / health endpoint
//!  * `runner`  – wiring of a complete publish or subscribe run
//!
//! The `mqtt-loadtest` binary is a thin clap front-end over [`runner`].

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;
pub mod runner;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use crate::config::{load_profile, Profile, PublishConfig, SubscribeConfig};
pub use crate::core::client::rumqtt::{RumqttClient, RumqttFactory};
pub use crate::core::publisher::PublisherPool;
pub use crate::core::subscriber::SubscriberPool;
pub use crate::metrics::{MetricsRecorder, Registry};
pub use crate::runner::{run_publish, run_subscribe};
