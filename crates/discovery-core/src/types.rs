use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::{DiscoveryError, Result};

pub const DEFAULT_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// ServiceStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
    Unknown,
}

impl ServiceStatus {
    pub fn all() -> &'static [ServiceStatus] {
        &[
            ServiceStatus::Starting,
            ServiceStatus::Healthy,
            ServiceStatus::Unhealthy,
            ServiceStatus::Stopping,
            ServiceStatus::Unknown,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Unknown => "unknown",
        }
    }

    /// Status that corresponds to a probe outcome.
    pub fn from_probe(healthy: bool) -> Self {
        if healthy {
            ServiceStatus::Healthy
        } else {
            ServiceStatus::Unhealthy
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ServiceEvent
// ---------------------------------------------------------------------------

/// Change notification delivered to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceEvent {
    Registered,
    Deregistered,
    Healthy,
    Unhealthy,
}

impl ServiceEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceEvent::Registered => "registered",
            ServiceEvent::Deregistered => "deregistered",
            ServiceEvent::Healthy => "healthy",
            ServiceEvent::Unhealthy => "unhealthy",
        }
    }

    /// Event fired when a registration transitions into `status`, if any.
    pub fn for_transition(status: ServiceStatus) -> Option<Self> {
        match status {
            ServiceStatus::Healthy => Some(ServiceEvent::Healthy),
            ServiceStatus::Unhealthy => Some(ServiceEvent::Unhealthy),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ServiceInstance
// ---------------------------------------------------------------------------

/// One network-reachable endpoint of a logical service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_id: String,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

impl ServiceInstance {
    pub fn new(
        service_id: impl Into<String>,
        service_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            service_name: service_name.into(),
            host: host.into(),
            port,
            metadata: HashMap::new(),
            health_check_url: None,
            tags: Vec::new(),
            version: default_version(),
        }
    }

    pub fn with_health_check(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.address())
    }

    pub fn is_health_checked(&self) -> bool {
        self.health_check_url.is_some()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.service_id.trim().is_empty() {
            return Err(DiscoveryError::InvalidInstance(
                "service_id must not be empty".into(),
            ));
        }
        if self.service_name.trim().is_empty() {
            return Err(DiscoveryError::InvalidInstance(format!(
                "service_name must not be empty (service_id '{}')",
                self.service_id
            )));
        }
        if self.port == 0 {
            return Err(DiscoveryError::InvalidInstance(format!(
                "port must be non-zero (service_id '{}')",
                self.service_id
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RegistrationOptions
// ---------------------------------------------------------------------------

/// Per-registration overrides of the configured probe interval and TTL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationOptions {
    pub health_check_interval: Option<Duration>,
    pub ttl: Option<Duration>,
}

// ---------------------------------------------------------------------------
// ServiceRegistration
// ---------------------------------------------------------------------------

/// Lifecycle state for one registered instance. Owned by the registry table.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub instance: ServiceInstance,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: ServiceStatus,
    pub health_check_interval: Duration,
    pub ttl: Duration,
    /// Bumped on every (re-)registration of the same id so a superseded
    /// health-check loop can tell its results are stale.
    pub(crate) generation: u64,
}

impl ServiceRegistration {
    pub(crate) fn new(
        instance: ServiceInstance,
        health_check_interval: Duration,
        ttl: Duration,
        generation: u64,
    ) -> Self {
        let now = Utc::now();
        let status = if instance.is_health_checked() {
            ServiceStatus::Starting
        } else {
            ServiceStatus::Healthy
        };
        Self {
            instance,
            registered_at: now,
            last_heartbeat: now,
            status,
            health_check_interval,
            ttl,
            generation,
        }
    }

    /// True when the heartbeat has been silent for longer than the TTL at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.last_heartbeat);
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => elapsed > ttl,
            Err(_) => false,
        }
    }

    pub fn view(&self) -> RegistrationView {
        RegistrationView {
            instance: self.instance.clone(),
            status: self.status,
            registered_at: self.registered_at,
            last_heartbeat: self.last_heartbeat,
            health_check_interval_secs: self.health_check_interval.as_secs(),
            ttl_secs: self.ttl.as_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// RegistrationView
// ---------------------------------------------------------------------------

/// Serializable snapshot of a registration returned by `list_services`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationView {
    #[serde(flatten)]
    pub instance: ServiceInstance,
    pub status: ServiceStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub health_check_interval_secs: u64,
    pub ttl_secs: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(instance: ServiceInstance, ttl_secs: u64) -> ServiceRegistration {
        ServiceRegistration::new(
            instance,
            Duration::from_secs(30),
            Duration::from_secs(ttl_secs),
            0,
        )
    }

    #[test]
    fn status_has_five_variants() {
        assert_eq!(ServiceStatus::all().len(), 5);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ServiceStatus::Unhealthy).unwrap();
        assert_eq!(json, "\"unhealthy\"");
        assert_eq!(ServiceStatus::Starting.to_string(), "starting");
    }

    #[test]
    fn transition_events_only_for_health_states() {
        assert_eq!(
            ServiceEvent::for_transition(ServiceStatus::Healthy),
            Some(ServiceEvent::Healthy)
        );
        assert_eq!(
            ServiceEvent::for_transition(ServiceStatus::Unhealthy),
            Some(ServiceEvent::Unhealthy)
        );
        assert_eq!(ServiceEvent::for_transition(ServiceStatus::Starting), None);
        assert_eq!(ServiceEvent::for_transition(ServiceStatus::Stopping), None);
    }

    #[test]
    fn instance_defaults_version() {
        let inst = ServiceInstance::new("svc-a", "cache", "10.0.0.1", 6379);
        assert_eq!(inst.version, "1.0.0");
        assert_eq!(inst.address(), "10.0.0.1:6379");
        assert_eq!(inst.base_url(), "http://10.0.0.1:6379");
        assert!(!inst.is_health_checked());
    }

    #[test]
    fn instance_deserializes_with_defaults() {
        let json = r#"{"service_id":"a","service_name":"cache","host":"h","port":1}"#;
        let inst: ServiceInstance = serde_json::from_str(json).unwrap();
        assert_eq!(inst.version, DEFAULT_VERSION);
        assert!(inst.tags.is_empty());
        assert!(inst.health_check_url.is_none());
    }

    #[test]
    fn validate_rejects_empty_id_and_zero_port() {
        let inst = ServiceInstance::new("", "cache", "h", 1);
        assert!(inst.validate().is_err());
        let inst = ServiceInstance::new("a", " ", "h", 1);
        assert!(inst.validate().is_err());
        let inst = ServiceInstance::new("a", "cache", "h", 0);
        assert!(inst.validate().is_err());
        let inst = ServiceInstance::new("a", "cache", "h", 1);
        assert!(inst.validate().is_ok());
    }

    #[test]
    fn registration_starts_healthy_without_health_url() {
        let inst = ServiceInstance::new("a", "cache", "h", 1);
        let reg = registration(inst, 300);
        assert_eq!(reg.status, ServiceStatus::Healthy);
        assert_eq!(reg.registered_at, reg.last_heartbeat);
    }

    #[test]
    fn registration_starts_starting_with_health_url() {
        let inst =
            ServiceInstance::new("a", "cache", "h", 1).with_health_check("http://h/health");
        let reg = registration(inst, 300);
        assert_eq!(reg.status, ServiceStatus::Starting);
    }

    #[test]
    fn expiry_is_strictly_greater_than_ttl() {
        let inst = ServiceInstance::new("a", "cache", "h", 1);
        let reg = registration(inst, 10);
        let at_ttl = reg.last_heartbeat + chrono::Duration::seconds(10);
        let past_ttl = reg.last_heartbeat + chrono::Duration::seconds(11);
        assert!(!reg.is_expired_at(at_ttl));
        assert!(reg.is_expired_at(past_ttl));
    }

    #[test]
    fn view_flattens_instance_fields() {
        let inst = ServiceInstance::new("a", "cache", "h", 1).with_tag("primary");
        let reg = registration(inst, 300);
        let value = serde_json::to_value(reg.view()).unwrap();
        assert_eq!(value["service_id"], "a");
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["tags"][0], "primary");
        assert_eq!(value["ttl_secs"], 300);
    }
}
