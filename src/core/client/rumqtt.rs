//! [`MqttClient`] backed by `rumqttc`.
//!
//! Each connected handle owns one `rumqttc` client/event-loop pair. A driver
//! task polls the event loop, dispatches inbound publishes to the registered
//! handlers and completes SUBSCRIBE / UNSUBSCRIBE waiters when the matching
//! acknowledgement arrives. The driver never reconnects: once the connection
//! drops the handle stays down until `connect` is called again.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use rumqttc::v5::mqttbytes::v5::{
    ConnectReturnCode as ConnectReturnCodeV5, Packet as PacketV5,
    SubscribeReasonCode as SubscribeReasonCodeV5,
};
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode, Transport};

use super::{ClientConfig, ClientFactory, MessageHandler, MqttClient, ProtocolVersion, Qos};
use crate::core::error::ClientError;

/// Capacity of the request channel between a handle and its event loop.
const REQUEST_CAPACITY: usize = 64;
/// How long `disconnect` waits for the DISCONNECT packet to be flushed.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Builds [`RumqttClient`] handles.
#[derive(Debug, Clone)]
pub struct RumqttFactory {
    request_capacity: usize,
}

impl RumqttFactory {
    pub fn new() -> Self {
        Self {
            request_capacity: REQUEST_CAPACITY,
        }
    }

    pub fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity.max(1);
        self
    }
}

impl Default for RumqttFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientFactory for RumqttFactory {
    type Client = RumqttClient;

    fn build(&self, config: ClientConfig) -> RumqttClient {
        if config.protocol == ProtocolVersion::V3 {
            warn!(
                client_id = %config.client_id,
                "MQTT 3.1 is served by the 3.1.1 client"
            );
        }
        RumqttClient {
            config,
            request_capacity: self.request_capacity,
            shared: Arc::new(Shared::default()),
            session: Mutex::new(None),
        }
    }
}

pub struct RumqttClient {
    config: ClientConfig,
    request_capacity: usize,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

struct Session {
    client: SessionClient,
    driver: JoinHandle<()>,
}

#[derive(Clone)]
enum SessionClient {
    V4(rumqttc::AsyncClient),
    V5(rumqttc::v5::AsyncClient),
}

impl SessionClient {
    async fn publish(&self, topic: &str, qos: Qos, payload: Bytes) -> Result<(), ClientError> {
        match self {
            SessionClient::V4(c) => c
                .publish(topic, qos_v4(qos), false, payload.to_vec())
                .await
                .map_err(request_error),
            SessionClient::V5(c) => c
                .publish(topic, qos_v5(qos), false, payload)
                .await
                .map_err(request_error),
        }
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), ClientError> {
        match self {
            SessionClient::V4(c) => c.subscribe(topic, qos_v4(qos)).await.map_err(request_error),
            SessionClient::V5(c) => c.subscribe(topic, qos_v5(qos)).await.map_err(request_error),
        }
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        match self {
            SessionClient::V4(c) => c.unsubscribe(topic).await.map_err(request_error),
            SessionClient::V5(c) => c.unsubscribe(topic).await.map_err(request_error),
        }
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        match self {
            SessionClient::V4(c) => c.disconnect().await.map_err(request_error),
            SessionClient::V5(c) => c.disconnect().await.map_err(request_error),
        }
    }
}

fn request_error(e: impl std::fmt::Display) -> ClientError {
    ClientError::Request(e.to_string())
}

fn qos_v4(qos: Qos) -> rumqttc::QoS {
    match qos {
        Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
        Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn qos_v5(qos: Qos) -> rumqttc::v5::mqttbytes::QoS {
    match qos {
        Qos::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
        Qos::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
        Qos::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
    }
}

// ───────────────────────────────────────────────────────────
// Acknowledgement tracking
// ───────────────────────────────────────────────────────────

type AckResult = Result<(), ClientError>;

struct Waiter {
    topic: String,
    tx: oneshot::Sender<AckResult>,
}

/// Requests leave the handle in FIFO order, so the n-th queued waiter belongs
/// to the n-th SUBSCRIBE/UNSUBSCRIBE the event loop writes. Once written, the
/// waiter is keyed by packet id until the acknowledgement arrives.
#[derive(Default)]
struct AckTracker {
    queued: VecDeque<Waiter>,
    inflight: HashMap<u16, Waiter>,
}

#[derive(Default)]
struct Shared {
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    acks: parking_lot::Mutex<AckTracker>,
}

impl Shared {
    fn enqueue_waiter(&self, topic: &str) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        self.acks.lock().queued.push_back(Waiter {
            topic: topic.to_string(),
            tx,
        });
        rx
    }

    fn drop_last_waiter(&self) {
        self.acks.lock().queued.pop_back();
    }

    /// Puts back whatever handled `topic` before a subscribe that failed.
    fn restore_handler(&self, topic: &str, previous: Option<Arc<dyn MessageHandler>>) {
        match previous {
            Some(handler) => {
                self.handlers.insert(topic.to_string(), handler);
            }
            None => {
                self.handlers.remove(topic);
            }
        }
    }

    fn apply(&self, event: SessionEvent) {
        match event {
            SessionEvent::Message { topic, payload } => {
                if let Some(handler) = self.handlers.get(&topic) {
                    handler.on_message(&topic, &payload);
                }
            }
            SessionEvent::RequestSent(pkid) => {
                let mut acks = self.acks.lock();
                if let Some(waiter) = acks.queued.pop_front() {
                    acks.inflight.insert(pkid, waiter);
                }
            }
            SessionEvent::Acked { pkid, granted } => {
                let waiter = self.acks.lock().inflight.remove(&pkid);
                if let Some(waiter) = waiter {
                    let result = if granted {
                        Ok(())
                    } else {
                        Err(ClientError::SubscribeRejected(waiter.topic))
                    };
                    let _ = waiter.tx.send(result);
                }
            }
            SessionEvent::ConnAck(_) | SessionEvent::DisconnectSent => {}
        }
    }

    fn fail_pending(&self) {
        let mut acks = self.acks.lock();
        for waiter in acks.queued.drain(..) {
            let _ = waiter.tx.send(Err(ClientError::NotConnected));
        }
        for (_, waiter) in acks.inflight.drain() {
            let _ = waiter.tx.send(Err(ClientError::NotConnected));
        }
    }
}

// ───────────────────────────────────────────────────────────
// Event loop driver
// ───────────────────────────────────────────────────────────

/// Protocol-independent view of the event loop output we care about.
#[derive(Debug)]
enum SessionEvent {
    ConnAck(Result<(), String>),
    Message { topic: String, payload: Bytes },
    RequestSent(u16),
    Acked { pkid: u16, granted: bool },
    DisconnectSent,
}

#[async_trait]
trait EventSource: Send + 'static {
    async fn next_event(&mut self) -> Result<Option<SessionEvent>, String>;
}

#[async_trait]
impl EventSource for rumqttc::EventLoop {
    async fn next_event(&mut self) -> Result<Option<SessionEvent>, String> {
        let event = self.poll().await.map_err(|e| e.to_string())?;
        Ok(match event {
            Event::Incoming(Packet::ConnAck(ack)) => Some(SessionEvent::ConnAck(
                match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(format!("{code:?}")),
                },
            )),
            Event::Incoming(Packet::Publish(publish)) => Some(SessionEvent::Message {
                topic: publish.topic,
                payload: publish.payload,
            }),
            Event::Incoming(Packet::SubAck(ack)) => Some(SessionEvent::Acked {
                pkid: ack.pkid,
                granted: ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_))),
            }),
            Event::Incoming(Packet::UnsubAck(ack)) => Some(SessionEvent::Acked {
                pkid: ack.pkid,
                granted: true,
            }),
            Event::Outgoing(Outgoing::Subscribe(pkid) | Outgoing::Unsubscribe(pkid)) => {
                Some(SessionEvent::RequestSent(pkid))
            }
            Event::Outgoing(Outgoing::Disconnect) => Some(SessionEvent::DisconnectSent),
            _ => None,
        })
    }
}

#[async_trait]
impl EventSource for rumqttc::v5::EventLoop {
    async fn next_event(&mut self) -> Result<Option<SessionEvent>, String> {
        let event = self.poll().await.map_err(|e| e.to_string())?;
        Ok(match event {
            rumqttc::v5::Event::Incoming(PacketV5::ConnAck(ack)) => Some(SessionEvent::ConnAck(
                match ack.code {
                    ConnectReturnCodeV5::Success => Ok(()),
                    code => Err(format!("{code:?}")),
                },
            )),
            rumqttc::v5::Event::Incoming(PacketV5::Publish(publish)) => {
                Some(SessionEvent::Message {
                    topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                    payload: publish.payload,
                })
            }
            rumqttc::v5::Event::Incoming(PacketV5::SubAck(ack)) => Some(SessionEvent::Acked {
                pkid: ack.pkid,
                granted: ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCodeV5::Success(_))),
            }),
            rumqttc::v5::Event::Incoming(PacketV5::UnsubAck(ack)) => Some(SessionEvent::Acked {
                pkid: ack.pkid,
                granted: true,
            }),
            rumqttc::v5::Event::Outgoing(
                Outgoing::Subscribe(pkid) | Outgoing::Unsubscribe(pkid),
            ) => Some(SessionEvent::RequestSent(pkid)),
            rumqttc::v5::Event::Outgoing(Outgoing::Disconnect) => {
                Some(SessionEvent::DisconnectSent)
            }
            _ => None,
        })
    }
}

async fn drive<S: EventSource>(
    mut source: S,
    shared: Arc<Shared>,
    connack: oneshot::Sender<AckResult>,
    client_id: String,
) {
    let mut connack = Some(connack);
    loop {
        match source.next_event().await {
            Ok(Some(SessionEvent::ConnAck(result))) => {
                let refused = result.is_err();
                if let Some(tx) = connack.take() {
                    let _ = tx.send(result.map_err(ClientError::Refused));
                }
                if refused {
                    break;
                }
            }
            Ok(Some(SessionEvent::DisconnectSent)) => {
                debug!(client_id = %client_id, "disconnect sent");
                break;
            }
            Ok(Some(event)) => shared.apply(event),
            Ok(None) => {}
            Err(e) => {
                match connack.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(ClientError::Connection(e)));
                    }
                    None => warn!(client_id = %client_id, "connection lost: {e}"),
                }
                break;
            }
        }
    }
    shared.fail_pending();
}

impl RumqttClient {
    fn spawn_session(&self, connack: oneshot::Sender<AckResult>) -> Session {
        let cfg = &self.config;
        let transport = if cfg.broker.tls {
            Transport::Tls(Default::default())
        } else {
            Transport::Tcp
        };
        let shared = Arc::clone(&self.shared);
        let client_id = cfg.client_id.clone();

        match cfg.protocol {
            ProtocolVersion::V5 => {
                let mut opts = rumqttc::v5::MqttOptions::new(
                    cfg.client_id.clone(),
                    cfg.broker.host.clone(),
                    cfg.broker.port,
                );
                opts.set_keep_alive(cfg.timeouts.keep_alive);
                opts.set_clean_start(cfg.clean_session);
                opts.set_transport(transport);
                if let Some(creds) = &cfg.credentials {
                    opts.set_credentials(creds.username.clone(), creds.password.clone());
                }
                let (client, eventloop) =
                    rumqttc::v5::AsyncClient::new(opts, self.request_capacity);
                Session {
                    client: SessionClient::V5(client),
                    driver: tokio::spawn(drive(eventloop, shared, connack, client_id)),
                }
            }
            ProtocolVersion::V3 | ProtocolVersion::V4 => {
                let mut opts = rumqttc::MqttOptions::new(
                    cfg.client_id.clone(),
                    cfg.broker.host.clone(),
                    cfg.broker.port,
                );
                opts.set_keep_alive(cfg.timeouts.keep_alive);
                opts.set_clean_session(cfg.clean_session);
                opts.set_transport(transport);
                if let Some(creds) = &cfg.credentials {
                    opts.set_credentials(creds.username.clone(), creds.password.clone());
                }
                let (client, eventloop) = rumqttc::AsyncClient::new(opts, self.request_capacity);
                Session {
                    client: SessionClient::V4(client),
                    driver: tokio::spawn(drive(eventloop, shared, connack, client_id)),
                }
            }
        }
    }

    async fn live_client(&self) -> Result<SessionClient, ClientError> {
        match self.session.lock().await.as_ref() {
            Some(session) if !session.driver.is_finished() => Ok(session.client.clone()),
            _ => Err(ClientError::NotConnected),
        }
    }

    async fn await_ack(
        &self,
        rx: oneshot::Receiver<AckResult>,
        operation: &'static str,
    ) -> Result<(), ClientError> {
        match timeout(self.config.timeouts.ping, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => Err(ClientError::Timeout(operation)),
        }
    }
}

#[async_trait]
impl MqttClient for RumqttClient {
    fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn connect(&self) -> Result<(), ClientError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if !session.driver.is_finished() {
                return Ok(());
            }
        }

        let (tx, rx) = oneshot::channel();
        let session = self.spawn_session(tx);
        let outcome = match timeout(self.config.timeouts.connect, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Connection(
                "event loop stopped before CONNACK".into(),
            )),
            Err(_) => Err(ClientError::Timeout("connect")),
        };

        match outcome {
            Ok(()) => {
                *guard = Some(session);
                Ok(())
            }
            Err(e) => {
                session.driver.abort();
                *guard = None;
                Err(e)
            }
        }
    }

    async fn publish(&self, topic: &str, qos: Qos, payload: Bytes) -> Result<(), ClientError> {
        let client = self.live_client().await?;
        client.publish(topic, qos, payload).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: Qos,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ClientError> {
        // A re-subscribe may fail while the earlier subscription is still live
        // at the broker, so a failure restores the earlier handler.
        let previous = self.shared.handlers.insert(topic.to_string(), handler);

        // Holding the session lock keeps waiter order identical to request order.
        let rx = {
            let guard = self.session.lock().await;
            let session = match guard.as_ref() {
                Some(session) if !session.driver.is_finished() => session,
                _ => {
                    self.shared.restore_handler(topic, previous);
                    return Err(ClientError::NotConnected);
                }
            };
            let rx = self.shared.enqueue_waiter(topic);
            if let Err(e) = session.client.subscribe(topic, qos).await {
                self.shared.drop_last_waiter();
                self.shared.restore_handler(topic, previous);
                return Err(e);
            }
            rx
        };

        let result = self.await_ack(rx, "subscribe").await;
        if result.is_err() {
            self.shared.restore_handler(topic, previous);
        }
        result
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        let rx = {
            let guard = self.session.lock().await;
            let session = match guard.as_ref() {
                Some(session) if !session.driver.is_finished() => session,
                _ => return Err(ClientError::NotConnected),
            };
            let rx = self.shared.enqueue_waiter(topic);
            if let Err(e) = session.client.unsubscribe(topic).await {
                self.shared.drop_last_waiter();
                return Err(e);
            }
            rx
        };

        self.await_ack(rx, "unsubscribe").await?;
        self.shared.handlers.remove(topic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Err(ClientError::NotConnected);
        };
        let sent = session.client.disconnect().await;
        if timeout(DISCONNECT_GRACE, &mut session.driver).await.is_err() {
            session.driver.abort();
        }
        self.shared.handlers.clear();
        sent
    }
}

impl Drop for RumqttClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.driver.abort();
        }
    }
}
