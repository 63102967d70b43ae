//! Subscriber identities and their three lifecycles.
//!
//! After the sequential ramp every identity is driven by two independent
//! background behaviours: a periodic re-subscription sweep over a separate
//! topic set, and a global round-robin churn that tears a session down and
//! rebuilds it in the same pool slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::SubscribeConfig;
use crate::core::client::{ClientFactory, MessageHandler, MqttClient, Qos};
use crate::core::error::{ChurnError, LoadtestError};
use crate::core::naming;
use crate::core::pool::{Pool, SlotLease};
use crate::metrics::MetricsRecorder;

/// Every subscription is made at QoS 0.
pub const SUBSCRIBE_QOS: Qos = Qos::AtMostOnce;

/// Pacing of the re-subscription sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberTimings {
    /// Wait before every sweep.
    pub resubscribe_interval: Duration,
    /// Wait before every topic within a sweep.
    pub resubscribe_topic_delay: Duration,
}

impl Default for SubscriberTimings {
    fn default() -> Self {
        Self {
            resubscribe_interval: Duration::from_secs(10),
            resubscribe_topic_delay: Duration::from_secs(1),
        }
    }
}

/// Counts messages delivered on one topic.
pub struct TopicCounter {
    topic: String,
    received: AtomicU64,
    metrics: Arc<dyn MetricsRecorder>,
}

impl TopicCounter {
    pub fn new(topic: impl Into<String>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            topic: topic.into(),
            received: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Messages seen by this handler alone.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl MessageHandler for TopicCounter {
    fn on_message(&self, _topic: &str, payload: &[u8]) {
        let seen = self.received.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.message_received(&self.topic);
        trace!(
            topic = %self.topic,
            "Subscriber received message {seen} ({} bytes)",
            payload.len()
        );
    }
}

/// Fleet of subscriber identities.
pub struct SubscriberPool<F: ClientFactory> {
    factory: Arc<F>,
    pool: Pool<F::Client>,
    topic_prefix: String,
    topics_per_subscriber: usize,
    timings: SubscriberTimings,
    metrics: Arc<dyn MetricsRecorder>,
    shutdown: CancellationToken,
}

impl<F: ClientFactory> Clone for SubscriberPool<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            pool: self.pool.clone(),
            topic_prefix: self.topic_prefix.clone(),
            topics_per_subscriber: self.topics_per_subscriber,
            timings: self.timings,
            metrics: Arc::clone(&self.metrics),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<F: ClientFactory> SubscriberPool<F> {
    /// Builds one unconnected handle per subscriber identity.
    pub fn new(factory: F, config: &SubscribeConfig, metrics: Arc<dyn MetricsRecorder>) -> Self {
        let clients: Vec<_> = (0..config.subscriber_count)
            .map(|index| factory.build(config.client_config(index)))
            .collect();
        Self {
            factory: Arc::new(factory),
            pool: Pool::new(clients),
            topic_prefix: config.topic_prefix.clone(),
            topics_per_subscriber: config.topics_per_subscriber,
            timings: SubscriberTimings::default(),
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_timings(mut self, timings: SubscriberTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Handle currently bound to the slot at `index`.
    pub fn client(&self, index: usize) -> Arc<F::Client> {
        self.pool.current(index)
    }

    /// Initial topic set of the subscriber at `index`.
    pub fn topics(&self, index: usize) -> Vec<String> {
        naming::topic_set(&self.topic_prefix, index, self.topics_per_subscriber)
    }

    /// Stops the re-subscription sweeps and the churn rotation.
    ///
    /// Churn cycles already in flight run to completion.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn handler(&self, topic: &str) -> Arc<dyn MessageHandler> {
        Arc::new(TopicCounter::new(topic, Arc::clone(&self.metrics)))
    }

    /// Sleeps for `delay`; `false` once shutdown has been requested.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    /// Connects every subscriber in index order and subscribes it to its
    /// initial topic set.
    ///
    /// The first connect or subscribe failure aborts the ramp.
    pub async fn subscribe(&self, connect_delay: Duration) -> Result<(), LoadtestError> {
        for index in 0..self.pool.len() {
            sleep(connect_delay).await;
            let client = self.pool.current(index);
            let identity = client.config().client_id.clone();
            debug!(identity = %identity, "Connecting with subscriber {index}");

            client
                .connect()
                .await
                .map_err(|source| LoadtestError::Connect {
                    identity: identity.clone(),
                    source,
                })?;
            self.metrics.subscriber_connected();

            for topic in self.topics(index) {
                debug!(identity = %identity, "Subscribing to {topic}");
                client
                    .subscribe(&topic, SUBSCRIBE_QOS, self.handler(&topic))
                    .await
                    .map_err(|source| LoadtestError::Subscribe {
                        identity: identity.clone(),
                        topic: topic.clone(),
                        source,
                    })?;
            }
        }
        info!(
            "Connected {} subscribers, {} topics each",
            self.pool.len(),
            self.topics_per_subscriber
        );
        Ok(())
    }

    /// Starts one re-subscription loop per subscriber.
    ///
    /// Every sweep waits the resubscribe interval, then subscribes to the
    /// sweep topic set one topic at a time. Failures are logged and the
    /// loop carries on.
    pub fn keep_subscribing(&self) -> Vec<JoinHandle<()>> {
        (0..self.pool.len())
            .map(|index| {
                let engine = self.clone();
                tokio::spawn(async move { engine.resubscribe_loop(index).await })
            })
            .collect()
    }

    async fn resubscribe_loop(&self, index: usize) {
        let topics = naming::resubscribe_topic_set(
            &self.topic_prefix,
            index,
            self.topics_per_subscriber,
            self.pool.len(),
        );
        'sweeps: loop {
            if !self.pause(self.timings.resubscribe_interval).await {
                break;
            }
            for topic in &topics {
                if !self.pause(self.timings.resubscribe_topic_delay).await {
                    break 'sweeps;
                }
                let client = self.pool.current(index);
                debug!(identity = %client.config().client_id, "Subscribing to {topic}");
                if let Err(e) = client.subscribe(topic, SUBSCRIBE_QOS, self.handler(topic)).await {
                    error!(
                        identity = %client.config().client_id,
                        topic = %topic,
                        "resubscribe failed: {e}"
                    );
                }
            }
        }
        debug!("re-subscription loop for subscriber {index} stopped");
    }

    /// Round-robin churn over every slot, one slot per `churn_rate`.
    ///
    /// Each cycle runs as its own task; the rotation moves on without waiting
    /// for it. Returns only after [`shutdown`](Self::shutdown).
    pub async fn churn(&self, churn_rate: Duration, connect_delay: Duration) {
        if self.pool.is_empty() {
            return;
        }
        info!("Starting churning at rate 1 per {churn_rate:?}");
        'rotation: loop {
            for index in 0..self.pool.len() {
                debug!("Churning subscriber {index}");
                let engine = self.clone();
                tokio::spawn(async move {
                    let _ = engine.churn_once(index, connect_delay).await;
                });
                if !self.pause(churn_rate).await {
                    break 'rotation;
                }
            }
        }
        debug!("churn rotation stopped");
    }

    /// Runs a single churn cycle on the slot at `index` and records the
    /// outcome.
    ///
    /// The old session is unsubscribed and disconnected, a fresh handle built
    /// from its configuration replaces it in the slot, and after
    /// `connect_delay` the new handle connects and subscribes to the same
    /// topics. Teardown failures are only logged. A slot that is still being
    /// churned is skipped and counts neither as churned nor as an error.
    pub async fn churn_once(&self, index: usize, connect_delay: Duration) -> Result<(), ChurnError> {
        let Some(lease) = self.pool.lease(index) else {
            debug!("subscriber {index} is still churning, skipping");
            return Err(ChurnError::Busy(index));
        };

        let result = self.rebuild(&lease, connect_delay).await;
        match &result {
            Ok(()) => self.metrics.connection_churned(),
            Err(e) => {
                error!(identity = %lease.current().config().client_id, "churn failed: {e}");
                self.metrics.churn_error();
            }
        }
        result
    }

    async fn rebuild(
        &self,
        lease: &SlotLease<F::Client>,
        connect_delay: Duration,
    ) -> Result<(), ChurnError> {
        let topics = self.topics(lease.index());
        let old = lease.current();
        let identity = old.config().client_id.clone();

        for topic in &topics {
            if let Err(e) = old.unsubscribe(topic).await {
                debug!(identity = %identity, topic = %topic, "unsubscribe during churn failed: {e}");
            }
        }
        if let Err(e) = old.disconnect().await {
            debug!(identity = %identity, "disconnect during churn failed: {e}");
        }

        let fresh = self.factory.build(old.config().clone());
        drop(old);
        drop(lease.replace(fresh));

        sleep(connect_delay).await;
        let client = lease.current();
        client.connect().await.map_err(ChurnError::Connect)?;

        for topic in topics {
            debug!(identity = %identity, "Subscribing to {topic}");
            if let Err(source) = client
                .subscribe(&topic, SUBSCRIBE_QOS, self.handler(&topic))
                .await
            {
                return Err(ChurnError::Subscribe { topic, source });
            }
        }
        Ok(())
    }
}
