use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid service instance: {0}")]
    InvalidInstance(String),

    #[error("invalid discovery config: {0}")]
    InvalidConfig(String),

    #[error("service discovery must be started from within a Tokio runtime")]
    NoRuntime,

    #[error("failed to build health check client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Reason a single health probe failed.
///
/// Probe failures never escape the checker; they are logged and folded into
/// an unhealthy result.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Request(String),
}

/// Error a watcher callback may return. Logged and otherwise ignored.
#[derive(Debug, Error)]
#[error("watcher failed: {0}")]
pub struct WatchError(pub String);

impl WatchError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
