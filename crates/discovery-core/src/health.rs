use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, ProbeError, Result};

// ─── HealthProbe ──────────────────────────────────────────────────────────

/// A single liveness check against an instance's health endpoint.
///
/// Implementations must never fail: every failure mode is folded into
/// `false`. `None` means the instance opted out of health checking and is
/// reported healthy without any I/O.
pub trait HealthProbe: Send + Sync + 'static {
    fn check<'a>(&'a self, url: Option<&'a str>) -> BoxFuture<'a, bool>;
}

// ─── HealthChecker ────────────────────────────────────────────────────────

/// HTTP health probe: `GET url`, any 2xx status is healthy.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: Client,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(connect_timeout: Duration, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()
            .map_err(DiscoveryError::HttpClient)?;
        Ok(Self { client, timeout })
    }

    pub fn from_config(config: &DiscoveryConfig) -> Result<Self> {
        Self::new(config.probe_connect_timeout(), config.probe_timeout())
    }

    /// Perform one probe and report why it failed, if it did.
    pub async fn probe(&self, url: &str) -> std::result::Result<(), ProbeError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status(status.as_u16()))
        }
    }

    fn classify(&self, err: reqwest::Error) -> ProbeError {
        if err.is_timeout() {
            ProbeError::Timeout(self.timeout.as_millis() as u64)
        } else if err.is_connect() {
            ProbeError::Connect(err.to_string())
        } else {
            ProbeError::Request(err.to_string())
        }
    }
}

impl HealthProbe for HealthChecker {
    fn check<'a>(&'a self, url: Option<&'a str>) -> BoxFuture<'a, bool> {
        async move {
            let Some(url) = url else {
                return true;
            };
            match self.probe(url).await {
                Ok(()) => {
                    debug!(url, "health check passed");
                    true
                }
                Err(reason) => {
                    warn!(url, %reason, "health check failed");
                    false
                }
            }
        }
        .boxed()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
