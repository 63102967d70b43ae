#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use mqtt_loadtest::config::{
    CommonSettings, PublishConfig, PublishSettings, SubscribeConfig, SubscribeSettings,
};
use mqtt_loadtest::core::client::{ClientConfig, ClientFactory, MessageHandler, MqttClient, Qos};
use mqtt_loadtest::core::error::ClientError;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        mqtt_loadtest::logging::init_logging("debug");
    });
}

pub fn common_settings() -> CommonSettings {
    CommonSettings {
        url: Some("tcp://broker.test:1883".into()),
        topic_prefix: Some("load".into()),
        connect_delay: Some(Duration::ZERO),
        ..CommonSettings::default()
    }
}

pub fn publish_config(publisher_count: usize, topic_count: usize) -> PublishConfig {
    PublishConfig::resolve(PublishSettings {
        common: common_settings(),
        publisher_count: Some(publisher_count),
        topic_count: Some(topic_count),
        publisher_prefix: Some("pub".into()),
        message_rate: Some(Duration::from_millis(10)),
        ..PublishSettings::default()
    })
    .expect("valid publish config")
}

pub fn subscribe_config(subscriber_count: usize, topics_per_subscriber: usize) -> SubscribeConfig {
    SubscribeConfig::resolve(SubscribeSettings {
        common: common_settings(),
        subscriber: Some(subscriber_count),
        topics_per_subscriber: Some(topics_per_subscriber),
        subscriber_prefix: Some("sub".into()),
        churn_rate: Some(Duration::from_secs(1)),
    })
    .expect("valid subscribe config")
}

/// In-memory broker shared by every fake handle of a test.
#[derive(Default)]
pub struct FakeBroker {
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    builds: Vec<ClientConfig>,
    connects: Vec<String>,
    disconnects: Vec<usize>,
    subscribe_calls: Vec<String>,
    unsubscribe_calls: Vec<String>,
    published: Vec<(String, Qos, Bytes)>,
    routes: HashMap<(usize, String), Arc<dyn MessageHandler>>,
    refuse_connect: HashSet<String>,
    reject_subscribe: HashSet<String>,
    connect_latency: Duration,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every later connect from `client_id` is refused.
    pub fn refuse_connect(&self, client_id: &str) {
        self.state.lock().refuse_connect.insert(client_id.to_string());
    }

    pub fn accept_connect(&self, client_id: &str) {
        self.state.lock().refuse_connect.remove(client_id);
    }

    /// Every later subscribe to `topic` is rejected.
    pub fn reject_subscribe(&self, topic: &str) {
        self.state.lock().reject_subscribe.insert(topic.to_string());
    }

    pub fn set_connect_latency(&self, latency: Duration) {
        self.state.lock().connect_latency = latency;
    }

    pub fn builds(&self) -> Vec<ClientConfig> {
        self.state.lock().builds.clone()
    }

    /// Client ids in connect order, refused attempts included.
    pub fn connect_attempts(&self) -> Vec<String> {
        self.state.lock().connects.clone()
    }

    pub fn disconnected_handles(&self) -> Vec<usize> {
        self.state.lock().disconnects.clone()
    }

    pub fn subscribe_calls(&self) -> Vec<String> {
        self.state.lock().subscribe_calls.clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<String> {
        self.state.lock().unsubscribe_calls.clone()
    }

    pub fn published_topics(&self) -> HashSet<String> {
        self.state
            .lock()
            .published
            .iter()
            .map(|(topic, _, _)| topic.clone())
            .collect()
    }

    pub fn published(&self) -> Vec<(String, Qos, Bytes)> {
        self.state.lock().published.clone()
    }

    /// Topics the handle with `handle_id` is currently subscribed to.
    pub fn subscriptions_of(&self, handle_id: usize) -> BTreeSet<String> {
        self.state
            .lock()
            .routes
            .keys()
            .filter(|(id, _)| *id == handle_id)
            .map(|(_, topic)| topic.clone())
            .collect()
    }

    /// Delivers one message to every subscriber of `topic`; returns how many.
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> usize {
        let handlers: Vec<_> = self
            .state
            .lock()
            .routes
            .iter()
            .filter(|((_, t), _)| t == topic)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in &handlers {
            handler.on_message(topic, payload);
        }
        handlers.len()
    }
}

pub struct FakeFactory {
    broker: Arc<FakeBroker>,
}

impl FakeFactory {
    pub fn new(broker: &Arc<FakeBroker>) -> Self {
        Self {
            broker: Arc::clone(broker),
        }
    }
}

impl ClientFactory for FakeFactory {
    type Client = FakeClient;

    fn build(&self, config: ClientConfig) -> FakeClient {
        let handle_id = {
            let mut state = self.broker.state.lock();
            state.builds.push(config.clone());
            state.builds.len() - 1
        };
        FakeClient {
            handle_id,
            config,
            broker: Arc::clone(&self.broker),
            connected: AtomicBool::new(false),
        }
    }
}

pub struct FakeClient {
    handle_id: usize,
    config: ClientConfig,
    broker: Arc<FakeBroker>,
    connected: AtomicBool,
}

impl FakeClient {
    /// Build sequence number; unique per handle.
    pub fn handle_id(&self) -> usize {
        self.handle_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }
}

#[async_trait]
impl MqttClient for FakeClient {
    fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn connect(&self) -> Result<(), ClientError> {
        let latency = {
            let mut state = self.broker.state.lock();
            state.connects.push(self.config.client_id.clone());
            if state.refuse_connect.contains(&self.config.client_id) {
                return Err(ClientError::Refused("not authorized".into()));
            }
            state.connect_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: Qos, payload: Bytes) -> Result<(), ClientError> {
        self.ensure_connected()?;
        self.broker
            .state
            .lock()
            .published
            .push((topic.to_string(), qos, payload));
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        _qos: Qos,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ClientError> {
        self.ensure_connected()?;
        let mut state = self.broker.state.lock();
        state.subscribe_calls.push(topic.to_string());
        if state.reject_subscribe.contains(topic) {
            return Err(ClientError::SubscribeRejected(topic.to_string()));
        }
        state.routes.insert((self.handle_id, topic.to_string()), handler);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.ensure_connected()?;
        let mut state = self.broker.state.lock();
        state.unsubscribe_calls.push(topic.to_string());
        state.routes.remove(&(self.handle_id, topic.to_string()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.ensure_connected()?;
        self.connected.store(false, Ordering::SeqCst);
        let mut state = self.broker.state.lock();
        state.disconnects.push(self.handle_id);
        let handle_id = self.handle_id;
        state.routes.retain(|(id, _), _| *id != handle_id);
        Ok(())
    }
}
