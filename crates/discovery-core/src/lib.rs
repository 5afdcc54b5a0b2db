//! `discovery-core` — in-process service registry for the agent coordinator.
//!
//! Tracks live service instances, probes their health endpoints, expires
//! registrations whose heartbeats stop, and tells watchers about every
//! transition.
//!
//! # Architecture
//!
//! ```text
//! ServiceInstance
//!     │  register_service / heartbeat / deregister_service
//!     ▼
//! ServiceDiscovery   ← registration table (service_id → ServiceRegistration)
//!     │                 one health-check task per instance with a health URL
//!     │                 one expiry sweep task
//!     ▼
//! HealthProbe        ← HealthChecker: GET url, 2xx = healthy
//!     │
//!     ▼
//! WatcherRegistry    ← per-service callbacks + broadcast change stream
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use discovery_core::{DiscoveryConfig, ServiceDiscovery, ServiceInstance};
//!
//! let discovery = ServiceDiscovery::new(DiscoveryConfig::default())?;
//! discovery.start()?;
//!
//! discovery.watch_service("cache", |event, instance| {
//!     println!("{event}: {}", instance.service_id);
//!     Ok(())
//! });
//!
//! discovery.register_service(
//!     ServiceInstance::new("cache-1", "cache", "10.0.0.2", 6379)
//!         .with_health_check("http://10.0.0.2/health"),
//! );
//!
//! let target = discovery.get_healthy_instance("cache");
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod types;
pub mod watcher;

pub use config::DiscoveryConfig;
pub use discovery::{DiscoveryStats, ServiceDiscovery, SystemInfo};
pub use error::{DiscoveryError, ProbeError, Result, WatchError};
pub use health::{HealthChecker, HealthProbe};
pub use types::{
    RegistrationOptions, RegistrationView, ServiceEvent, ServiceInstance, ServiceRegistration,
    ServiceStatus,
};
pub use watcher::{ServiceChange, WatchCallback, WatcherRegistry};
