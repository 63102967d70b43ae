use thiserror::Error;

/// Failure reported by a protocol client handle.
///
/// The engines never branch on the variant: network, authentication and
/// protocol failures are all treated as one opaque error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error("connection refused by broker: {0}")]
    Refused(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("request could not be queued: {0}")]
    Request(String),
    #[error("subscription to `{0}` rejected by broker")]
    SubscribeRejected(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// Errors that abort a ramp phase or the host process.
#[derive(Debug, Error)]
pub enum LoadtestError {
    #[error("connect failed for {identity}: {source}")]
    Connect {
        identity: String,
        #[source]
        source: ClientError,
    },
    #[error("subscribe to `{topic}` failed for {identity}: {source}")]
    Subscribe {
        identity: String,
        topic: String,
        #[source]
        source: ClientError,
    },
    #[error("metrics server error: {0}")]
    Http(#[from] hyper::Error),
}

/// Why a single churn cycle did not complete.
#[derive(Debug, Error)]
pub enum ChurnError {
    #[error("slot {0} is still being churned")]
    Busy(usize),
    #[error("reconnect failed: {0}")]
    Connect(#[source] ClientError),
    #[error("resubscribe to `{topic}` failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: ClientError,
    },
}
