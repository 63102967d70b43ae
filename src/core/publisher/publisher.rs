use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::PublishConfig;
use crate::core::client::{ClientFactory, MqttClient, Qos};
use crate::core::error::LoadtestError;
use crate::core::naming;
use crate::core::pool::Pool;
use crate::metrics::MetricsRecorder;

/// Length of every generated payload.
pub const PAYLOAD_LEN: usize = 20;

/// Random alphanumeric payload of `len` characters.
pub fn random_payload(len: usize) -> Bytes {
    let payload: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect();
    Bytes::from(payload)
}

/// Uniform sample from `[0, 2 * rate)`.
///
/// Every send loop draws its own delay so loops sharing a rate drift apart
/// instead of hitting the broker in lockstep.
pub fn jittered_delay(rate: Duration) -> Duration {
    let upper = rate.as_nanos().saturating_mul(2).min(u64::MAX as u128) as u64;
    if upper == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..upper))
}

/// Fleet of publisher identities.
///
/// Publishers connect once during the ramp and keep that connection for the
/// lifetime of the process.
pub struct PublisherPool<F: ClientFactory> {
    pool: Pool<F::Client>,
    topic_prefix: String,
    metrics: Arc<dyn MetricsRecorder>,
    shutdown: CancellationToken,
}

impl<F: ClientFactory> PublisherPool<F> {
    /// Builds one unconnected handle per publisher identity. Publishers never
    /// rebuild their handles, so the factory is dropped afterwards.
    pub fn new(factory: F, config: &PublishConfig, metrics: Arc<dyn MetricsRecorder>) -> Self {
        let clients = (0..config.publisher_count).map(|index| factory.build(config.client_config(index)));
        Self {
            pool: Pool::new(clients),
            topic_prefix: config.topic_prefix.clone(),
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn client(&self, index: usize) -> Arc<F::Client> {
        self.pool.current(index)
    }

    /// Stops every send loop after its current iteration.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Connects every publisher in index order, `connect_delay` apart.
    ///
    /// The first failure aborts the ramp; no further connects are attempted.
    pub async fn connect(&self, topic_count: usize, connect_delay: Duration) -> Result<(), LoadtestError> {
        for index in 0..self.pool.len() {
            sleep(connect_delay).await;
            let client = self.pool.current(index);
            let identity = client.config().client_id.clone();
            debug!(identity = %identity, "Connecting with publisher {index}");

            client
                .connect()
                .await
                .map_err(|source| LoadtestError::Connect { identity, source })?;
            self.metrics.publisher_connected();
        }
        info!(
            "Connected {} publishers, {} topics each",
            self.pool.len(),
            topic_count
        );
        Ok(())
    }

    /// Launches one send loop per (publisher, topic) pair.
    ///
    /// Loops run until [`shutdown`](Self::shutdown); the returned handles are
    /// only needed by callers that want to await that.
    pub fn publish(&self, qos: Qos, topic_count: usize, message_rate: Duration) -> Vec<JoinHandle<()>> {
        let mut loops = Vec::with_capacity(self.pool.len() * topic_count);
        for index in 0..self.pool.len() {
            for sub_slot in 0..topic_count {
                let topic = naming::topic_name(&self.topic_prefix, index, topic_count, sub_slot);
                debug!("Starting publishing for publisher {index} in topic {topic}");
                let send_loop = SendLoop {
                    pool: self.pool.clone(),
                    index,
                    publisher: index.to_string(),
                    topic,
                    qos,
                    message_rate,
                    metrics: Arc::clone(&self.metrics),
                    shutdown: self.shutdown.clone(),
                };
                loops.push(tokio::spawn(send_loop.run()));
            }
        }
        loops
    }
}

struct SendLoop<C> {
    pool: Pool<C>,
    index: usize,
    publisher: String,
    topic: String,
    qos: Qos,
    message_rate: Duration,
    metrics: Arc<dyn MetricsRecorder>,
    shutdown: CancellationToken,
}

impl<C: MqttClient> SendLoop<C> {
    async fn run(self) {
        let mut sent: u64 = 0;
        loop {
            let client = self.pool.current(self.index);
            trace!(
                publisher = %self.publisher,
                topic = %self.topic,
                "Publishing message {sent}"
            );
            match client.publish(&self.topic, self.qos, random_payload(PAYLOAD_LEN)).await {
                Ok(()) => {
                    self.metrics.message_published(&self.publisher, &self.topic);
                    sent += 1;
                }
                Err(e) => error!(
                    publisher = %self.publisher,
                    topic = %self.topic,
                    "publish failed: {e}"
                ),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(jittered_delay(self.message_rate)) => {}
            }
        }
        debug!(publisher = %self.publisher, topic = %self.topic, "send loop stopped after {sent} messages");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn payload_is_fixed_length_alphanumeric() {
        let payload = random_payload(PAYLOAD_LEN);
        assert_eq!(payload.len(), PAYLOAD_LEN);
        assert!(payload.iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn jitter_stays_below_twice_the_rate() {
        let rate = Duration::from_millis(50);
        for _ in 0..10_000 {
            assert!(jittered_delay(rate) < rate * 2);
        }
    }

    #[test]
    fn jitter_is_not_periodic() {
        let rate = Duration::from_secs(1);
        let samples: HashSet<Duration> = (0..100).map(|_| jittered_delay(rate)).collect();
        assert!(samples.len() > 50);
    }

    #[test]
    fn zero_rate_means_no_delay() {
        assert_eq!(jittered_delay(Duration::ZERO), Duration::ZERO);
    }
}
