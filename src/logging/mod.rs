use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over `level` so individual modules can be turned up
/// without touching the command line.
pub fn init_logging(level: &str) {
    let filter: EnvFilter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let formatting_layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_target(true)
        .compact();

    let subscriber = Registry::default().with(filter).with(formatting_layer);

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global subscriber");
}

/// Accepted values of `--log-level`.
pub fn parse_level(value: &str) -> Result<String, String> {
    match value.to_ascii_lowercase().as_str() {
        level @ ("error" | "warn" | "info" | "debug" | "trace") => Ok(level.to_string()),
        other => Err(format!(
            "unknown log level `{other}` (expected error, warn, info, debug or trace)"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_level;

    #[test]
    fn levels_are_case_insensitive() {
        assert_eq!(parse_level("DEBUG").unwrap(), "debug");
        assert!(parse_level("verbose").is_err());
    }
}
