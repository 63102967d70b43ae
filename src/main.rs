//! mqtt-loadtest command line.
//!
//! `publish` and `subscribe` take every setting as a flag; `run` reads the
//! same settings from a TOML profile.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::info;

use mqtt_loadtest::config::{
    load_profile, parse_duration, CommonSettings, Profile, PublishConfig, PublishSettings,
    SubscribeConfig, SubscribeSettings, CONFIG_ENV, DEFAULT_LISTEN_ADDR, DEFAULT_METRICS_PATH,
    DEFAULT_PUBLISHER_PREFIX, DEFAULT_SUBSCRIBER_PREFIX, DEFAULT_TOPIC_PREFIX,
};
use mqtt_loadtest::logging::{init_logging, parse_level};
use mqtt_loadtest::runner::{run_publish, run_subscribe, termination};
use mqtt_loadtest::{Registry, RumqttFactory};

#[derive(Debug, Parser)]
#[command(
    name = "mqtt-loadtest",
    version,
    about = "A high performance loadtest for the MQTT protocol"
)]
struct Cli {
    /// Log level (`error`, `warn`, `info`, `debug`, `trace`)
    #[arg(long, global = true, default_value = "info", value_parser = parse_level)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Publishes to a set of topics with a certain amount of publishers
    Publish(PublishArgs),
    /// Subscribes to a set of topics with a certain amount of subscribers
    Subscribe(SubscribeArgs),
    /// Runs the publish or subscribe profile described in a TOML file
    Run {
        /// Profile path
        #[arg(short, long, env = CONFIG_ENV)]
        config: Option<PathBuf>,
    },
    /// Prints the version
    Version,
}

/// Flags shared by `publish` and `subscribe`.
#[derive(Debug, Args)]
struct ConnectionArgs {
    /// URL of the MQTT broker (`tcp://host:1883`, `ssl://host:8883`)
    #[arg(short, long)]
    url: String,

    /// Prefix which forms the topic name together with the topic slot
    #[arg(short = 'p', long, default_value = DEFAULT_TOPIC_PREFIX)]
    topic_prefix: String,

    /// MQTT protocol version (3, 4 (3.1.1) and 5 supported)
    #[arg(long, default_value_t = 4)]
    protocol_version: u8,

    /// Delay before connecting the next client during the initial ramp
    #[arg(short = 'd', long, default_value = "200ms", value_parser = parse_duration)]
    connect_delay: Duration,

    /// Clean session flag for MQTT connections
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    clean_session: bool,

    /// Path on which Prometheus can scrape
    #[arg(long, default_value = DEFAULT_METRICS_PATH)]
    prometheus_path: String,

    /// Whether Prometheus metrics should be exported
    #[arg(long, default_value_t = false, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    prometheus_enabled: bool,

    /// Address on which metrics and health are served (`127.0.0.1:8081`, `:8081`)
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDR)]
    listen_address: String,

    /// MQTT user
    #[arg(long, default_value = "")]
    user: String,

    /// MQTT password
    #[arg(long, default_value = "")]
    password: String,
}

impl ConnectionArgs {
    fn into_common(self) -> CommonSettings {
        CommonSettings {
            url: Some(self.url),
            topic_prefix: Some(self.topic_prefix),
            protocol_version: Some(self.protocol_version),
            clean_session: Some(self.clean_session),
            connect_delay: Some(self.connect_delay),
            user: Some(self.user),
            password: Some(self.password),
            prometheus_enabled: Some(self.prometheus_enabled),
            prometheus_path: Some(self.prometheus_path),
            listen_address: Some(self.listen_address),
        }
    }
}

#[derive(Debug, Args)]
struct PublishArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Topics per publisher
    #[arg(short = 'c', long, default_value_t = 10)]
    topic_count: usize,

    /// QoS of every published message (0, 1, 2)
    #[arg(short = 'q', long, default_value_t = 0)]
    qos_type: u8,

    /// Prefix which forms the publisher client id together with its index
    #[arg(long, default_value = DEFAULT_PUBLISHER_PREFIX)]
    publisher_prefix: String,

    /// Count of publishers
    #[arg(long, default_value_t = 1)]
    publisher_count: usize,

    /// Mean delay between two messages of one publisher on one topic
    #[arg(short = 'm', long, default_value = "1s", value_parser = parse_duration)]
    message_rate: Duration,
}

impl PublishArgs {
    fn into_settings(self) -> PublishSettings {
        PublishSettings {
            common: self.connection.into_common(),
            topic_count: Some(self.topic_count),
            publisher_prefix: Some(self.publisher_prefix),
            publisher_count: Some(self.publisher_count),
            qos_type: Some(self.qos_type),
            message_rate: Some(self.message_rate),
        }
    }
}

#[derive(Debug, Args)]
struct SubscribeArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Count of subscribers
    #[arg(short = 's', long, default_value_t = 1)]
    subscriber: usize,

    /// Count of topics a subscriber subscribes to
    #[arg(short = 't', long, default_value_t = 1)]
    topics_per_subscriber: usize,

    /// Prefix which forms the subscriber client id together with its index
    #[arg(long, default_value = DEFAULT_SUBSCRIBER_PREFIX)]
    subscriber_prefix: String,

    /// Delay between churns of two consecutive subscribers
    #[arg(short = 'r', long, default_value = "1s", value_parser = parse_duration)]
    churn_rate: Duration,
}

impl SubscribeArgs {
    fn into_settings(self) -> SubscribeSettings {
        SubscribeSettings {
            common: self.connection.into_common(),
            subscriber: Some(self.subscriber),
            topics_per_subscriber: Some(self.topics_per_subscriber),
            subscriber_prefix: Some(self.subscriber_prefix),
            churn_rate: Some(self.churn_rate),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let profile = match cli.command {
        Command::Version => {
            println!("mqtt-loadtest/{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::Publish(args) => Profile::Publish(PublishConfig::resolve(args.into_settings())?),
        Command::Subscribe(args) => {
            Profile::Subscribe(SubscribeConfig::resolve(args.into_settings())?)
        }
        Command::Run { config } => load_profile(config.as_deref())?,
    };

    init_logging(&cli.log_level);
    let registry = Arc::new(Registry::new());
    let factory = RumqttFactory::new();

    match profile {
        Profile::Publish(config) => {
            let publishers = run_publish(factory, &config, registry).await?;
            termination().await?;
            publishers.shutdown();
        }
        Profile::Subscribe(config) => {
            let subscribers = run_subscribe(factory, &config, registry).await?;
            termination().await?;
            subscribers.shutdown();
        }
    }

    info!("Stopped");
    Ok(())
}
