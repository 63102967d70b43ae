//! Load-test counters.
//!
//! Engines receive an `Arc<dyn MetricsRecorder>` at construction and never
//! touch process globals. [`Registry`] is the production recorder: lock-free
//! counters rendered in the Prometheus text format by [`Registry::snapshot`].

pub mod http;

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

pub use http::serve_metrics;

pub const PUBLISHER_NAMESPACE: &str = "mqtt_loadtest_publisher";
pub const SUBSCRIBER_NAMESPACE: &str = "mqtt_loadtest_subscriber";

/// Sink for every counter the engines increment.
pub trait MetricsRecorder: Send + Sync {
    fn message_published(&self, publisher: &str, topic: &str);
    fn publisher_connected(&self);
    fn message_received(&self, topic: &str);
    fn subscriber_connected(&self);
    fn connection_churned(&self);
    fn churn_error(&self);
}

/// Process-lifetime counter registry.
#[derive(Debug, Default)]
pub struct Registry {
    published: DashMap<(String, String), AtomicU64>,
    connected_publishers: AtomicU64,
    received: DashMap<String, AtomicU64>,
    connected_subscribers: AtomicU64,
    churned: AtomicU64,
    churn_errors: AtomicU64,
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self, publisher: &str, topic: &str) -> u64 {
        self.published
            .get(&(publisher.to_string(), topic.to_string()))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of distinct `{publisher, topic}` series seen so far.
    pub fn published_series(&self) -> usize {
        self.published.len()
    }

    pub fn published_total(&self) -> u64 {
        self.published
            .iter()
            .map(|c| c.value().load(Ordering::Relaxed))
            .sum()
    }

    pub fn received(&self, topic: &str) -> u64 {
        self.received
            .get(topic)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn connected_publishers(&self) -> u64 {
        self.connected_publishers.load(Ordering::Relaxed)
    }

    pub fn connected_subscribers(&self) -> u64 {
        self.connected_subscribers.load(Ordering::Relaxed)
    }

    pub fn churned(&self) -> u64 {
        self.churned.load(Ordering::Relaxed)
    }

    pub fn churn_errors(&self) -> u64 {
        self.churn_errors.load(Ordering::Relaxed)
    }

    /// Renders every counter in the Prometheus text exposition format.
    pub fn snapshot(&self) -> String {
        let mut out = String::with_capacity(1024);

        let mut published: Vec<_> = self
            .published
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        published.sort();
        header(&mut out, PUBLISHER_NAMESPACE, "messages_total", "How many messages were sent");
        for ((publisher, topic), value) in published {
            let _ = writeln!(
                out,
                "{PUBLISHER_NAMESPACE}_messages_total{{publisher=\"{}\",topic=\"{}\"}} {value}",
                escape_label(&publisher),
                escape_label(&topic)
            );
        }
        scalar(
            &mut out,
            PUBLISHER_NAMESPACE,
            "connected_publishers_total",
            "How many publishers are active",
            self.connected_publishers(),
        );

        let mut received: Vec<_> = self
            .received
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        received.sort();
        header(&mut out, SUBSCRIBER_NAMESPACE, "messages_total", "Number of received messages");
        for (topic, value) in received {
            let _ = writeln!(
                out,
                "{SUBSCRIBER_NAMESPACE}_messages_total{{topic=\"{}\"}} {value}",
                escape_label(&topic)
            );
        }
        scalar(
            &mut out,
            SUBSCRIBER_NAMESPACE,
            "connected_subscribers_total",
            "Number of connected subscribers",
            self.connected_subscribers(),
        );
        scalar(
            &mut out,
            SUBSCRIBER_NAMESPACE,
            "churned_connections_total",
            "Number of churned connections",
            self.churned(),
        );
        scalar(
            &mut out,
            SUBSCRIBER_NAMESPACE,
            "churning_errors_total",
            "Number of connection failures while churning",
            self.churn_errors(),
        );

        out
    }
}

fn header(out: &mut String, namespace: &str, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {namespace}_{name} {help}");
    let _ = writeln!(out, "# TYPE {namespace}_{name} counter");
}

fn scalar(out: &mut String, namespace: &str, name: &str, help: &str, value: u64) {
    header(out, namespace, name, help);
    let _ = writeln!(out, "{namespace}_{name} {value}");
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

impl MetricsRecorder for Registry {
    fn message_published(&self, publisher: &str, topic: &str) {
        let key = (publisher.to_string(), topic.to_string());
        if let Some(counter) = self.published.get(&key) {
            bump(&counter);
            return;
        }
        bump(&self.published.entry(key).or_default());
    }

    fn publisher_connected(&self) {
        bump(&self.connected_publishers);
    }

    fn message_received(&self, topic: &str) {
        if let Some(counter) = self.received.get(topic) {
            bump(&counter);
            return;
        }
        bump(&self.received.entry(topic.to_string()).or_default());
    }

    fn subscriber_connected(&self) {
        bump(&self.connected_subscribers);
    }

    fn connection_churned(&self) {
        bump(&self.churned);
    }

    fn churn_error(&self) {
        bump(&self.churn_errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn labeled_counters_are_independent() {
        let registry = Registry::new();
        registry.message_published("0", "t0");
        registry.message_published("0", "t0");
        registry.message_published("1", "t0");
        registry.message_received("t0");

        assert_eq!(registry.published("0", "t0"), 2);
        assert_eq!(registry.published("1", "t0"), 1);
        assert_eq!(registry.published("2", "t0"), 0);
        assert_eq!(registry.published_series(), 2);
        assert_eq!(registry.published_total(), 3);
        assert_eq!(registry.received("t0"), 1);
    }

    #[test]
    fn snapshot_renders_prometheus_text() {
        let registry = Registry::new();
        registry.message_published("1", "mqtt-loadtest3");
        registry.publisher_connected();
        registry.message_received("mqtt-loadtest3");
        registry.connection_churned();
        registry.churn_error();

        let text = registry.snapshot();
        assert!(text.contains(
            "mqtt_loadtest_publisher_messages_total{publisher=\"1\",topic=\"mqtt-loadtest3\"} 1"
        ));
        assert!(text.contains("mqtt_loadtest_publisher_connected_publishers_total 1"));
        assert!(text.contains("mqtt_loadtest_subscriber_messages_total{topic=\"mqtt-loadtest3\"} 1"));
        assert!(text.contains("mqtt_loadtest_subscriber_connected_subscribers_total 0"));
        assert!(text.contains("mqtt_loadtest_subscriber_churned_connections_total 1"));
        assert!(text.contains("mqtt_loadtest_subscriber_churning_errors_total 1"));
        assert!(text.contains("# TYPE mqtt_loadtest_subscriber_churned_connections_total counter"));
    }

    #[test]
    fn label_values_are_escaped() {
        assert_eq!(escape_label("a\"b\\c"), "a\\\"b\\\\c");
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        registry.message_received("hot");
                        registry.connection_churned();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.received("hot"), 8_000);
        assert_eq!(registry.churned(), 8_000);
    }
}
