//! Wiring of a single run mode.
//!
//! Each entry point optionally starts the metrics endpoint, performs the
//! blocking ramp and hands the engine back once its steady-state load is
//! running in the background.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};

use crate::config::{MetricsSettings, PublishConfig, SubscribeConfig};
use crate::core::client::ClientFactory;
use crate::core::error::LoadtestError;
use crate::core::publisher::PublisherPool;
use crate::core::subscriber::SubscriberPool;
use crate::metrics::{http::bind_metrics, MetricsRecorder, Registry};

/// Starts the metrics endpoint when enabled and returns its bound address.
///
/// A bind failure is reported to the caller; once bound, server errors are
/// only logged.
pub fn spawn_metrics(
    settings: &MetricsSettings,
    registry: &Arc<Registry>,
) -> Result<Option<SocketAddr>, LoadtestError> {
    if !settings.enabled {
        return Ok(None);
    }
    let (addr, server) = bind_metrics(
        settings.listen_addr,
        settings.path.clone(),
        Arc::clone(registry),
    )?;
    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("metrics server stopped: {e}");
        }
    });
    Ok(Some(addr))
}

/// Ramps up the publishers and starts every send loop.
pub async fn run_publish<F: ClientFactory>(
    factory: F,
    config: &PublishConfig,
    registry: Arc<Registry>,
) -> Result<PublisherPool<F>, LoadtestError> {
    spawn_metrics(&config.metrics, &registry)?;

    info!(
        "Publishing to {} topics with prefix {} on {}",
        config.topic_count, config.topic_prefix, config.connection.broker
    );
    let metrics: Arc<dyn MetricsRecorder> = registry;
    let publishers = PublisherPool::new(factory, config, metrics);
    publishers
        .connect(config.topic_count, config.connect_delay)
        .await?;

    info!("Starting publishing at rate 1 per {:?}", config.message_rate);
    publishers.publish(config.qos, config.topic_count, config.message_rate);
    Ok(publishers)
}

/// Ramps up the subscribers, then starts re-subscription and churn.
pub async fn run_subscribe<F: ClientFactory>(
    factory: F,
    config: &SubscribeConfig,
    registry: Arc<Registry>,
) -> Result<SubscriberPool<F>, LoadtestError> {
    spawn_metrics(&config.metrics, &registry)?;

    info!(
        "Subscribing {} subscribers with prefix {} on {}",
        config.subscriber_count, config.topic_prefix, config.connection.broker
    );
    let metrics: Arc<dyn MetricsRecorder> = registry;
    let subscribers = SubscriberPool::new(factory, config, metrics);
    subscribers.subscribe(config.connect_delay).await?;

    info!("Starting to subscribe continuously");
    subscribers.keep_subscribing();

    let churner = subscribers.clone();
    let (churn_rate, connect_delay) = (config.churn_rate, config.connect_delay);
    tokio::spawn(async move { churner.churn(churn_rate, connect_delay).await });
    Ok(subscribers)
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
pub async fn termination() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C");
        Ok(())
    }
}
