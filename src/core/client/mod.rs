//! Protocol client seam.
//!
//! The engines only ever talk to brokers through [`MqttClient`] handles built
//! by a [`ClientFactory`]. Building a handle performs no I/O; the connection is
//! opened by [`MqttClient::connect`].

pub mod rumqtt;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::ConfigError;
use crate::core::error::ClientError;

pub use rumqtt::{RumqttClient, RumqttFactory};

/// Requested delivery guarantee, passed through to the client untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(ConfigError::InvalidQos(other)),
        }
    }
}

/// MQTT protocol level as numbered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// MQTT 3.1
    V3,
    /// MQTT 3.1.1
    V4,
    /// MQTT 5.0
    V5,
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(ProtocolVersion::V3),
            4 => Ok(ProtocolVersion::V4),
            5 => Ok(ProtocolVersion::V5),
            other => Err(ConfigError::InvalidProtocolVersion(other)),
        }
    }
}

/// Broker endpoint parsed from the operator supplied URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    /// Accepts `host:port`, `host`, or either form behind a `tcp://`,
    /// `mqtt://`, `ssl://`, `mqtts://` or `tls://` scheme.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ConfigError::MissingUrl);
        }

        let (scheme, rest) = match url.find("://") {
            Some(pos) => (&url[..pos], &url[pos + 3..]),
            None => ("tcp", url),
        };
        let tls = match scheme.to_ascii_lowercase().as_str() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" | "tls" => true,
            _ => return Err(ConfigError::InvalidUrl(url.to_string())),
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rfind(':') {
            Some(pos) => {
                let port = rest[pos + 1..]
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidUrl(url.to_string()))?;
                (&rest[..pos], port)
            }
            None => (rest, if tls { 8883 } else { 1883 }),
        };
        if host.is_empty() {
            return Err(ConfigError::InvalidUrl(url.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-connection timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    /// Upper bound on waiting for a broker acknowledgement.
    pub ping: Duration,
    pub keep_alive: Duration,
}

impl Timeouts {
    /// Defaults used for publishers.
    pub const fn client_defaults() -> Self {
        Self {
            connect: Duration::from_secs(30),
            ping: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
        }
    }

    /// Subscribers sit idle for long stretches and get more generous limits.
    pub const fn subscriber() -> Self {
        Self {
            connect: Duration::from_secs(50),
            ping: Duration::from_secs(50),
            keep_alive: Duration::from_secs(50),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::client_defaults()
    }
}

/// Everything needed to (re)build a handle for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub broker: BrokerAddress,
    pub protocol: ProtocolVersion,
    pub credentials: Option<Credentials>,
    pub client_id: String,
    pub clean_session: bool,
    pub timeouts: Timeouts,
}

/// Receives every message delivered on a subscribed topic.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// A single broker session.
///
/// Handles are shared between tasks behind an `Arc`, so every operation takes
/// `&self`.
#[async_trait]
pub trait MqttClient: Send + Sync + 'static {
    /// Configuration the handle was built from.
    fn config(&self) -> &ClientConfig;

    async fn connect(&self) -> Result<(), ClientError>;

    /// Hands the message to the session; does not wait for broker acknowledgement.
    async fn publish(&self, topic: &str, qos: Qos, payload: Bytes) -> Result<(), ClientError>;

    /// Subscribes and waits for the broker's acknowledgement.
    async fn subscribe(
        &self,
        topic: &str,
        qos: Qos,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ClientError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError>;

    async fn disconnect(&self) -> Result<(), ClientError>;
}

/// Builds unconnected client handles.
pub trait ClientFactory: Send + Sync + 'static {
    type Client: MqttClient;

    fn build(&self, config: ClientConfig) -> Self::Client;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_host_port() {
        let addr = BrokerAddress::parse("127.0.0.1:1883").unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 1883);
        assert!(!addr.tls);
    }

    #[test]
    fn parses_schemes_and_default_ports() {
        let addr = BrokerAddress::parse("tcp://localhost").unwrap();
        assert_eq!((addr.host.as_str(), addr.port, addr.tls), ("localhost", 1883, false));

        let addr = BrokerAddress::parse("ssl://broker.example.com").unwrap();
        assert_eq!(addr.port, 8883);
        assert!(addr.tls);

        let addr = BrokerAddress::parse("mqtts://broker:9000/").unwrap();
        assert_eq!((addr.port, addr.tls), (9000, true));
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(matches!(BrokerAddress::parse(""), Err(ConfigError::MissingUrl)));
        assert!(BrokerAddress::parse("http://host:1883").is_err());
        assert!(BrokerAddress::parse("host:notaport").is_err());
        assert!(BrokerAddress::parse(":1883").is_err());
    }

    #[test]
    fn qos_and_protocol_from_wire_numbers() {
        assert_eq!(Qos::try_from(1).unwrap(), Qos::AtLeastOnce);
        assert!(Qos::try_from(3).is_err());
        assert_eq!(ProtocolVersion::try_from(5).unwrap(), ProtocolVersion::V5);
        assert!(ProtocolVersion::try_from(6).is_err());
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials {
            username: "load".into(),
            password: "hunter2".into(),
        };
        let printed = format!("{creds:?}");
        assert!(printed.contains("load"));
        assert!(!printed.contains("hunter2"));
    }
}
