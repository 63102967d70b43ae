//! Run configuration.
//!
//! Settings arrive either from the command line or from a TOML profile. Both
//! sources are first collected into the loose `*Settings` structs (every field
//! optional) and then resolved into validated [`PublishConfig`] /
//! [`SubscribeConfig`] values, so defaults and validation live in one place.

use std::env;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::core::client::{BrokerAddress, ClientConfig, Credentials, ProtocolVersion, Qos, Timeouts};
use crate::core::naming;

pub const DEFAULT_TOPIC_PREFIX: &str = "mqtt-loadtest";
pub const DEFAULT_PUBLISHER_PREFIX: &str = "mqtt-loadtest-pub";
pub const DEFAULT_SUBSCRIBER_PREFIX: &str = "mqtt-loadtest-sub";
pub const DEFAULT_TOPIC_COUNT: usize = 10;
pub const DEFAULT_PROTOCOL_VERSION: u8 = 4;
pub const DEFAULT_CONNECT_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_MESSAGE_RATE: Duration = Duration::from_secs(1);
pub const DEFAULT_CHURN_RATE: Duration = Duration::from_secs(1);
pub const DEFAULT_METRICS_PATH: &str = "/metrics";
pub const DEFAULT_LISTEN_ADDR: &str = ":8080";

/// Environment variable naming the profile used by `run`.
pub const CONFIG_ENV: &str = "MQTT_LOADTEST_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("broker URL is required")]
    MissingUrl,
    #[error("invalid broker URL `{0}`")]
    InvalidUrl(String),
    #[error("unsupported protocol version {0} (expected 3, 4 or 5)")]
    InvalidProtocolVersion(u8),
    #[error("invalid QoS {0} (expected 0, 1 or 2)")]
    InvalidQos(u8),
    #[error("{0} must be greater than zero")]
    ZeroCount(&'static str),
    #[error("invalid duration `{0}`")]
    InvalidDuration(String),
    #[error("invalid listen address `{0}`")]
    InvalidListenAddr(String),
    #[error("metrics path must start with `/`, got `{0}`")]
    InvalidMetricsPath(String),
    #[error("profile must contain exactly one of [publish] or [subscribe]")]
    AmbiguousProfile,
    #[error("no profile given (pass --config or set {CONFIG_ENV})")]
    MissingProfilePath,
}

// ───────────────────────────────────────────────────────────
// Loose settings (CLI / TOML)
// ───────────────────────────────────────────────────────────

/// Settings shared by both run modes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommonSettings {
    pub url: Option<String>,
    pub topic_prefix: Option<String>,
    pub protocol_version: Option<u8>,
    pub clean_session: Option<bool>,
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub connect_delay: Option<Duration>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub prometheus_enabled: Option<bool>,
    pub prometheus_path: Option<String>,
    pub listen_address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishSettings {
    #[serde(flatten)]
    pub common: CommonSettings,
    pub topic_count: Option<usize>,
    pub publisher_prefix: Option<String>,
    pub publisher_count: Option<usize>,
    pub qos_type: Option<u8>,
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub message_rate: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscribeSettings {
    #[serde(flatten)]
    pub common: CommonSettings,
    pub subscriber: Option<usize>,
    pub topics_per_subscriber: Option<usize>,
    pub subscriber_prefix: Option<String>,
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub churn_rate: Option<Duration>,
}

/// Durations in a profile are either integer milliseconds or strings such as
/// `"200ms"` / `"1m30s"`.
fn de_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Millis(ms)) => Ok(Some(Duration::from_millis(ms))),
        Some(Raw::Text(text)) => parse_duration(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

// ───────────────────────────────────────────────────────────
// Resolved configuration
// ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub path: String,
    pub listen_addr: SocketAddr,
}

/// Connection parameters every identity of a pool shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub broker: BrokerAddress,
    pub protocol: ProtocolVersion,
    pub credentials: Option<Credentials>,
    pub clean_session: bool,
}

impl ConnectionSettings {
    pub fn client_config(&self, client_id: String, timeouts: Timeouts) -> ClientConfig {
        ClientConfig {
            broker: self.broker.clone(),
            protocol: self.protocol,
            credentials: self.credentials.clone(),
            client_id,
            clean_session: self.clean_session,
            timeouts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub connection: ConnectionSettings,
    pub topic_prefix: String,
    pub topic_count: usize,
    pub publisher_prefix: String,
    pub publisher_count: usize,
    pub qos: Qos,
    pub connect_delay: Duration,
    pub message_rate: Duration,
    pub metrics: MetricsSettings,
}

impl PublishConfig {
    pub fn resolve(settings: PublishSettings) -> Result<Self, ConfigError> {
        let common = ResolvedCommon::resolve(settings.common)?;
        let topic_count = settings.topic_count.unwrap_or(DEFAULT_TOPIC_COUNT);
        let publisher_count = settings.publisher_count.unwrap_or(1);
        if topic_count == 0 {
            return Err(ConfigError::ZeroCount("topic-count"));
        }
        if publisher_count == 0 {
            return Err(ConfigError::ZeroCount("publisher-count"));
        }

        Ok(Self {
            connection: common.connection,
            topic_prefix: common.topic_prefix,
            topic_count,
            publisher_prefix: settings
                .publisher_prefix
                .unwrap_or_else(|| DEFAULT_PUBLISHER_PREFIX.to_string()),
            publisher_count,
            qos: Qos::try_from(settings.qos_type.unwrap_or(0))?,
            connect_delay: common.connect_delay,
            message_rate: settings.message_rate.unwrap_or(DEFAULT_MESSAGE_RATE),
            metrics: common.metrics,
        })
    }

    /// Client configuration of the publisher at `index`.
    pub fn client_config(&self, index: usize) -> ClientConfig {
        self.connection.client_config(
            naming::client_id(&self.publisher_prefix, index),
            Timeouts::client_defaults(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeConfig {
    pub connection: ConnectionSettings,
    pub topic_prefix: String,
    pub topics_per_subscriber: usize,
    pub subscriber_prefix: String,
    pub subscriber_count: usize,
    pub connect_delay: Duration,
    pub churn_rate: Duration,
    pub metrics: MetricsSettings,
}

impl SubscribeConfig {
    pub fn resolve(settings: SubscribeSettings) -> Result<Self, ConfigError> {
        let common = ResolvedCommon::resolve(settings.common)?;
        let subscriber_count = settings.subscriber.unwrap_or(1);
        let topics_per_subscriber = settings.topics_per_subscriber.unwrap_or(1);
        if subscriber_count == 0 {
            return Err(ConfigError::ZeroCount("subscriber"));
        }
        if topics_per_subscriber == 0 {
            return Err(ConfigError::ZeroCount("topics-per-subscriber"));
        }

        Ok(Self {
            connection: common.connection,
            topic_prefix: common.topic_prefix,
            topics_per_subscriber,
            subscriber_prefix: settings
                .subscriber_prefix
                .unwrap_or_else(|| DEFAULT_SUBSCRIBER_PREFIX.to_string()),
            subscriber_count,
            connect_delay: common.connect_delay,
            churn_rate: settings.churn_rate.unwrap_or(DEFAULT_CHURN_RATE),
            metrics: common.metrics,
        })
    }

    /// Client configuration of the subscriber at `index`.
    pub fn client_config(&self, index: usize) -> ClientConfig {
        self.connection.client_config(
            naming::client_id(&self.subscriber_prefix, index),
            Timeouts::subscriber(),
        )
    }
}

struct ResolvedCommon {
    connection: ConnectionSettings,
    topic_prefix: String,
    connect_delay: Duration,
    metrics: MetricsSettings,
}

impl ResolvedCommon {
    fn resolve(common: CommonSettings) -> Result<Self, ConfigError> {
        let broker = BrokerAddress::parse(common.url.as_deref().unwrap_or_default())?;
        let protocol =
            ProtocolVersion::try_from(common.protocol_version.unwrap_or(DEFAULT_PROTOCOL_VERSION))?;

        // An empty user means anonymous, whatever the password says.
        let credentials = match common.user {
            Some(user) if !user.is_empty() => Some(Credentials {
                username: user,
                password: common.password.unwrap_or_default(),
            }),
            _ => None,
        };

        let path = common
            .prometheus_path
            .unwrap_or_else(|| DEFAULT_METRICS_PATH.to_string());
        if !path.starts_with('/') {
            return Err(ConfigError::InvalidMetricsPath(path));
        }
        let listen_addr = parse_listen_addr(
            common
                .listen_address
                .as_deref()
                .unwrap_or(DEFAULT_LISTEN_ADDR),
        )?;

        Ok(Self {
            connection: ConnectionSettings {
                broker,
                protocol,
                credentials,
                clean_session: common.clean_session.unwrap_or(true),
            },
            topic_prefix: common
                .topic_prefix
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            connect_delay: common.connect_delay.unwrap_or(DEFAULT_CONNECT_DELAY),
            metrics: MetricsSettings {
                enabled: common.prometheus_enabled.unwrap_or(false),
                path,
                listen_addr,
            },
        })
    }
}

// ───────────────────────────────────────────────────────────
// Profiles
// ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ProfileFile {
    publish: Option<PublishSettings>,
    subscribe: Option<SubscribeSettings>,
}

/// A resolved TOML profile: exactly one run mode.
#[derive(Debug, Clone)]
pub enum Profile {
    Publish(PublishConfig),
    Subscribe(SubscribeConfig),
}

/// Parses a profile from TOML text.
pub fn parse_profile(raw: &str) -> Result<Profile, ConfigError> {
    let file: ProfileFile = toml::from_str(raw)?;
    match (file.publish, file.subscribe) {
        (Some(publish), None) => Ok(Profile::Publish(PublishConfig::resolve(publish)?)),
        (None, Some(subscribe)) => Ok(Profile::Subscribe(SubscribeConfig::resolve(subscribe)?)),
        _ => Err(ConfigError::AmbiguousProfile),
    }
}

/// Loads a profile from `path`, falling back to `$MQTT_LOADTEST_CONFIG`.
pub fn load_profile<P: AsRef<Path>>(path: Option<P>) -> Result<Profile, ConfigError> {
    let raw = match path {
        Some(p) => fs::read_to_string(p)?,
        None => {
            let p = env::var(CONFIG_ENV).map_err(|_| ConfigError::MissingProfilePath)?;
            fs::read_to_string(p)?
        }
    };
    parse_profile(&raw)
}

// ───────────────────────────────────────────────────────────
// Value parsers
// ───────────────────────────────────────────────────────────

/// Parses durations such as `200ms`, `1s`, `1m30s`, `1.5s` or a bare `0`.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total_nanos: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(invalid());
        }
        let number = &rest[..num_len];
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale: u128 = match &rest[..unit_len] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        let nanos = if number.contains('.') {
            let value: f64 = number.parse().map_err(|_| invalid())?;
            (value * scale as f64).round() as u128
        } else {
            number
                .parse::<u128>()
                .map_err(|_| invalid())?
                .checked_mul(scale)
                .ok_or_else(invalid)?
        };
        total_nanos = total_nanos.checked_add(nanos).ok_or_else(invalid)?;
    }

    let nanos = u64::try_from(total_nanos).map_err(|_| invalid())?;
    Ok(Duration::from_nanos(nanos))
}

/// Parses a listen address; a bare `:port` binds every interface.
pub fn parse_listen_addr(input: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = || ConfigError::InvalidListenAddr(input.to_string());
    let trimmed = input.trim();
    let candidate = if trimmed.starts_with(':') {
        format!("0.0.0.0{trimmed}")
    } else {
        trimmed.to_string()
    };

    if let Ok(addr) = candidate.parse::<SocketAddr>() {
        return Ok(addr);
    }
    candidate
        .to_socket_addrs()
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)
}
