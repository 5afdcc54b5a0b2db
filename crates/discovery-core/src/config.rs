use crate::error::{DiscoveryError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Overrides `expiry_sweep_interval_secs` when set to a positive integer.
pub const SWEEP_INTERVAL_ENV: &str = "DISCOVERY_EXPIRY_SWEEP_SECS";

/// Upper bound for every interval and TTL, in seconds (one year). Timers
/// computed from larger values overflow `Instant`.
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

// ---------------------------------------------------------------------------
// DiscoveryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Default seconds between health probes for a registration.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// Default seconds of heartbeat silence before a registration expires.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub expiry_sweep_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub probe_connect_timeout_ms: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_ttl() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    2_000
}

fn default_probe_timeout() -> u64 {
    5_000
}

fn default_event_capacity() -> usize {
    256
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval(),
            ttl_secs: default_ttl(),
            expiry_sweep_interval_secs: default_sweep_interval(),
            probe_connect_timeout_ms: default_connect_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            event_channel_capacity: default_event_capacity(),
        }
    }
}

impl DiscoveryConfig {
    /// Load config from a YAML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&data)
    }

    pub fn from_yaml_str(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides. Unparseable, zero or out-of-range values
    /// are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(secs) = std::env::var(SWEEP_INTERVAL_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| (1..=MAX_INTERVAL_SECS).contains(v))
        {
            self.expiry_sweep_interval_secs = secs;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("ttl_secs", self.ttl_secs),
            ("expiry_sweep_interval_secs", self.expiry_sweep_interval_secs),
            ("probe_connect_timeout_ms", self.probe_connect_timeout_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(DiscoveryError::InvalidConfig(format!(
                    "{field} must be greater than zero"
                )));
            }
        }
        let intervals = [
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("ttl_secs", self.ttl_secs),
            ("expiry_sweep_interval_secs", self.expiry_sweep_interval_secs),
        ];
        for (field, value) in intervals {
            if value > MAX_INTERVAL_SECS {
                return Err(DiscoveryError::InvalidConfig(format!(
                    "{field} must not exceed {MAX_INTERVAL_SECS}"
                )));
            }
        }
        if self.event_channel_capacity == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "event_channel_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs)
    }

    pub fn probe_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_connect_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.health_check_interval(), Duration::from_secs(30));
        assert_eq!(config.ttl(), Duration::from_secs(300));
        assert_eq!(config.expiry_sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.probe_connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.probe_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config = DiscoveryConfig::from_yaml_str("ttl_secs: 10\n").unwrap();
        assert_eq!(config.ttl_secs, 10);
        assert_eq!(config.health_check_interval_secs, 30);
        assert_eq!(config.event_channel_capacity, 256);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = DiscoveryConfig::from_yaml_str("expiry_sweep_interval_secs: 0\n").unwrap_err();
        assert!(err.to_string().contains("expiry_sweep_interval_secs"));
    }

    #[test]
    fn oversized_interval_is_rejected() {
        let yaml = "expiry_sweep_interval_secs: 18446744073709551615\n";
        let err = DiscoveryConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("expiry_sweep_interval_secs"));

        let config = DiscoveryConfig {
            health_check_interval_secs: MAX_INTERVAL_SECS + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DiscoveryConfig {
            ttl_secs: MAX_INTERVAL_SECS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    // Only test touching the variable; all cases stay in one function.
    #[test]
    fn env_override_replaces_sweep_interval() {
        std::env::set_var(SWEEP_INTERVAL_ENV, "15");
        assert_eq!(
            DiscoveryConfig::default()
                .with_env_overrides()
                .expiry_sweep_interval_secs,
            15
        );

        for ignored in ["0", "soon", "-5", "18446744073709551615"] {
            std::env::set_var(SWEEP_INTERVAL_ENV, ignored);
            assert_eq!(
                DiscoveryConfig::default()
                    .with_env_overrides()
                    .expiry_sweep_interval_secs,
                60,
                "value {ignored:?} should be ignored"
            );
        }

        std::env::remove_var(SWEEP_INTERVAL_ENV);
        assert_eq!(
            DiscoveryConfig::default().with_env_overrides(),
            DiscoveryConfig::default()
        );
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let config = DiscoveryConfig::load(&dir.path().join("discovery.yaml")).unwrap();
        assert_eq!(config, DiscoveryConfig::default());
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("discovery.yaml");
        std::fs::write(
            &path,
            "health_check_interval_secs: 5\nprobe_timeout_ms: 750\n",
        )
        .unwrap();
        let config = DiscoveryConfig::load(&path).unwrap();
        assert_eq!(config.health_check_interval_secs, 5);
        assert_eq!(config.probe_timeout(), Duration::from_millis(750));
    }

    #[test]
    fn load_rejects_malformed_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("discovery.yaml");
        std::fs::write(&path, "ttl_secs: [not, a, number]\n").unwrap();
        assert!(DiscoveryConfig::load(&path).is_err());
    }
}
