//! The registration table and the operations that read and mutate it.
//!
//! The table is guarded by a single mutex. Every read-modify-write sequence
//! (register, deregister, heartbeat, probe result, expiry) runs under one
//! lock acquisition and never across an `.await`. Each mutation queues its
//! change event before the lock is released, so watchers observe changes in
//! the order they were applied. Watcher callbacks always run after the lock
//! is released.

mod expiry;
mod health_loop;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{DiscoveryConfig, MAX_INTERVAL_SECS};
use crate::error::{DiscoveryError, Result, WatchError};
use crate::health::{HealthChecker, HealthProbe};
use crate::types::{
    RegistrationOptions, RegistrationView, ServiceEvent, ServiceInstance, ServiceRegistration,
    ServiceStatus,
};
use crate::watcher::{ServiceChange, WatcherRegistry};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub service_count: usize,
    pub running: bool,
    pub by_status: BTreeMap<ServiceStatus, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInfo {
    #[serde(flatten)]
    pub stats: DiscoveryStats,
    pub watched_services: Vec<String>,
    pub active_health_checks: usize,
    pub expiry_sweep_interval_secs: u64,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Table {
    registrations: HashMap<String, ServiceRegistration>,
    health_tasks: HashMap<String, JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
    /// Set while running; background tasks are spawned onto it.
    runtime: Option<Handle>,
    next_generation: u64,
}

impl Table {
    fn abort_all(&mut self) {
        for (_, task) in self.health_tasks.drain() {
            task.abort();
        }
        if let Some(task) = self.sweep_task.take() {
            task.abort();
        }
        self.runtime = None;
    }
}

struct Inner {
    config: DiscoveryConfig,
    probe: Arc<dyn HealthProbe>,
    table: Mutex<Table>,
    watchers: WatcherRegistry,
    running: AtomicBool,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let table = self.table.get_mut().unwrap_or_else(PoisonError::into_inner);
        table.abort_all();
    }
}

// ---------------------------------------------------------------------------
// ServiceDiscovery
// ---------------------------------------------------------------------------

/// In-process service registry.
///
/// Cloning is cheap and every clone shares the same table. Background tasks
/// hold only a weak reference, so dropping the last clone stops them.
#[derive(Clone)]
pub struct ServiceDiscovery {
    inner: Arc<Inner>,
}

impl ServiceDiscovery {
    /// Build a registry that probes health endpoints over HTTP.
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        let checker = HealthChecker::from_config(&config)?;
        Self::with_probe(config, Arc::new(checker))
    }

    /// Build a registry with a custom health probe.
    pub fn with_probe(config: DiscoveryConfig, probe: Arc<dyn HealthProbe>) -> Result<Self> {
        config.validate()?;
        let watchers = WatcherRegistry::new(config.event_channel_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                probe,
                table: Mutex::new(Table::default()),
                watchers,
                running: AtomicBool::new(false),
            }),
        })
    }

    /// Load config from a YAML file (defaults when missing), apply
    /// environment overrides and build an HTTP-probing registry.
    pub fn from_config_file(path: &Path) -> Result<Self> {
        let config = DiscoveryConfig::load(path)?.with_env_overrides();
        Self::new(config)
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start the expiry sweep and a health-check loop for every registration
    /// that has a health endpoint. Must be called from within a Tokio runtime.
    /// Calling `start` on a running registry is a no-op.
    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| DiscoveryError::NoRuntime)?;
        let mut table = self.inner.table();
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let sweep_interval = self.inner.config.expiry_sweep_interval();
        table.sweep_task = Some(runtime.spawn(expiry::run(
            Arc::downgrade(&self.inner),
            sweep_interval,
        )));

        let pending: Vec<(String, u64, String, Duration)> = table
            .registrations
            .values()
            .filter_map(|reg| {
                let url = reg.instance.health_check_url.clone()?;
                Some((
                    reg.instance.service_id.clone(),
                    reg.generation,
                    url,
                    reg.health_check_interval,
                ))
            })
            .collect();
        for (service_id, generation, url, interval) in pending {
            let task = runtime.spawn(health_loop::run(
                Arc::downgrade(&self.inner),
                service_id.clone(),
                generation,
                url,
                interval,
            ));
            table.health_tasks.insert(service_id, task);
        }
        table.runtime = Some(runtime);

        info!(
            registrations = table.registrations.len(),
            health_checks = table.health_tasks.len(),
            sweep_interval_secs = sweep_interval.as_secs(),
            "service discovery started"
        );
        Ok(())
    }

    /// Cancel every health-check loop and the expiry sweep. Registrations
    /// are kept; a later `start` resumes checking them.
    pub fn stop(&self) {
        let mut table = self.inner.table();
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let cancelled = table.health_tasks.len();
        table.abort_all();
        info!(cancelled_health_checks = cancelled, "service discovery stopped");
    }

    // ─── Registration ────────────────────────────────────────────────────

    /// Register `instance`, replacing any registration with the same id.
    ///
    /// Returns `false` (and logs why) when the instance is rejected.
    pub fn register_service(&self, instance: ServiceInstance) -> bool {
        self.register_service_with(instance, RegistrationOptions::default())
    }

    /// Like [`register_service`](Self::register_service), overriding the
    /// configured probe interval and TTL for this registration.
    pub fn register_service_with(
        &self,
        instance: ServiceInstance,
        options: RegistrationOptions,
    ) -> bool {
        let service_id = instance.service_id.clone();
        match self.try_register(instance, options) {
            Ok(()) => true,
            Err(e) => {
                warn!(service_id = %service_id, error = %e, "service registration rejected");
                false
            }
        }
    }

    fn try_register(&self, instance: ServiceInstance, options: RegistrationOptions) -> Result<()> {
        instance.validate()?;
        let interval = options
            .health_check_interval
            .unwrap_or_else(|| self.inner.config.health_check_interval());
        let ttl = options.ttl.unwrap_or_else(|| self.inner.config.ttl());
        if interval.is_zero() || ttl.is_zero() {
            return Err(DiscoveryError::InvalidInstance(format!(
                "health check interval and ttl must be non-zero (service_id '{}')",
                instance.service_id
            )));
        }
        let max = Duration::from_secs(MAX_INTERVAL_SECS);
        if interval > max || ttl > max {
            return Err(DiscoveryError::InvalidInstance(format!(
                "health check interval and ttl must not exceed {MAX_INTERVAL_SECS}s \
                 (service_id '{}')",
                instance.service_id
            )));
        }

        let snapshot = instance.clone();
        let status = {
            let mut table = self.inner.table();
            let service_id = instance.service_id.clone();
            if let Some(previous) = table.health_tasks.remove(&service_id) {
                previous.abort();
            }

            table.next_generation += 1;
            let generation = table.next_generation;
            let registration = ServiceRegistration::new(instance, interval, ttl, generation);
            let status = registration.status;

            let task = match (&table.runtime, &registration.instance.health_check_url) {
                (Some(runtime), Some(url)) if self.inner.is_running() => Some(runtime.spawn(
                    health_loop::run(
                        Arc::downgrade(&self.inner),
                        service_id.clone(),
                        generation,
                        url.clone(),
                        interval,
                    ),
                )),
                _ => None,
            };
            if let Some(task) = task {
                table.health_tasks.insert(service_id.clone(), task);
            }
            self.inner
                .watchers
                .enqueue(ServiceEvent::Registered, &registration.instance);
            table.registrations.insert(service_id, registration);
            status
        };

        info!(
            service_id = %snapshot.service_id,
            service = %snapshot.service_name,
            address = %snapshot.address(),
            %status,
            "service registered"
        );
        self.inner.watchers.dispatch();
        Ok(())
    }

    /// Remove a registration. Returns `false` for an unknown id.
    pub fn deregister_service(&self, service_id: &str) -> bool {
        self.remove_registration(service_id, None)
    }

    /// Remove `service_id` only if it is still expired at `now`. A heartbeat
    /// or re-registration that landed after the sweep took its snapshot
    /// keeps the registration alive.
    fn deregister_if_stale(&self, service_id: &str, now: DateTime<Utc>) -> bool {
        self.remove_registration(service_id, Some(now))
    }

    fn remove_registration(&self, service_id: &str, stale_at: Option<DateTime<Utc>>) -> bool {
        let removed = {
            let mut table = self.inner.table();
            match (table.registrations.get(service_id), stale_at) {
                (None, _) => return false,
                (Some(reg), Some(now)) if !reg.is_expired_at(now) => return false,
                _ => {}
            }
            let Some(mut registration) = table.registrations.remove(service_id) else {
                return false;
            };
            registration.status = ServiceStatus::Stopping;
            if let Some(task) = table.health_tasks.remove(service_id) {
                task.abort();
            }
            self.inner
                .watchers
                .enqueue(ServiceEvent::Deregistered, &registration.instance);
            registration
        };

        info!(
            service_id = %service_id,
            service = %removed.instance.service_name,
            "service deregistered"
        );
        self.inner.watchers.dispatch();
        true
    }

    /// Record a heartbeat. An unhealthy instance is treated as recovered.
    /// Returns `false` for an unknown id.
    pub fn heartbeat(&self, service_id: &str) -> bool {
        let recovered = {
            let mut table = self.inner.table();
            let Some(registration) = table.registrations.get_mut(service_id) else {
                return false;
            };
            registration.last_heartbeat = Utc::now();
            let recovered = registration.status == ServiceStatus::Unhealthy;
            if recovered {
                registration.status = ServiceStatus::Healthy;
                self.inner
                    .watchers
                    .enqueue(ServiceEvent::Healthy, &registration.instance);
            }
            recovered
        };

        debug!(service_id = %service_id, "heartbeat");
        if recovered {
            info!(service_id = %service_id, "service recovered by heartbeat");
            self.inner.watchers.dispatch();
        }
        true
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// Instances registered under `service_name`, oldest registration first.
    /// With `healthy_only`, only instances whose status is `Healthy`.
    pub fn discover_services(
        &self,
        service_name: &str,
        healthy_only: bool,
    ) -> Vec<ServiceInstance> {
        let table = self.inner.table();
        let mut matches: Vec<&ServiceRegistration> = table
            .registrations
            .values()
            .filter(|reg| reg.instance.service_name == service_name)
            .filter(|reg| !healthy_only || reg.status == ServiceStatus::Healthy)
            .collect();
        sort_by_registration(&mut matches);
        matches.into_iter().map(|reg| reg.instance.clone()).collect()
    }

    pub fn get_service_by_id(&self, service_id: &str) -> Option<ServiceInstance> {
        let table = self.inner.table();
        table
            .registrations
            .get(service_id)
            .map(|reg| reg.instance.clone())
    }

    /// First healthy instance of `service_name`.
    ///
    /// This is a deterministic first pick (the oldest healthy registration),
    /// not round-robin: callers wanting load spreading must do it themselves.
    pub fn get_healthy_instance(&self, service_name: &str) -> Option<ServiceInstance> {
        self.discover_services(service_name, true).into_iter().next()
    }

    pub fn get_service_status(&self, service_id: &str) -> Option<ServiceStatus> {
        let table = self.inner.table();
        table.registrations.get(service_id).map(|reg| reg.status)
    }

    /// Snapshot of every registration grouped by service name.
    pub fn list_services(&self) -> BTreeMap<String, Vec<RegistrationView>> {
        let table = self.inner.table();
        let mut all: Vec<&ServiceRegistration> = table.registrations.values().collect();
        sort_by_registration(&mut all);

        let mut grouped: BTreeMap<String, Vec<RegistrationView>> = BTreeMap::new();
        for reg in all {
            grouped
                .entry(reg.instance.service_name.clone())
                .or_default()
                .push(reg.view());
        }
        grouped
    }

    pub fn get_stats(&self) -> DiscoveryStats {
        let table = self.inner.table();
        let mut by_status: BTreeMap<ServiceStatus, usize> =
            ServiceStatus::all().iter().map(|status| (*status, 0)).collect();
        let mut names: Vec<&str> = Vec::with_capacity(table.registrations.len());
        for reg in table.registrations.values() {
            *by_status.entry(reg.status).or_default() += 1;
            names.push(&reg.instance.service_name);
        }
        names.sort_unstable();
        names.dedup();

        DiscoveryStats {
            total_instances: table.registrations.len(),
            healthy_instances: by_status
                .get(&ServiceStatus::Healthy)
                .copied()
                .unwrap_or(0),
            service_count: names.len(),
            running: self.inner.is_running(),
            by_status,
        }
    }

    pub fn get_system_info(&self) -> SystemInfo {
        let stats = self.get_stats();
        let active_health_checks = self
            .inner
            .table()
            .health_tasks
            .values()
            .filter(|task| !task.is_finished())
            .count();
        SystemInfo {
            stats,
            watched_services: self.inner.watchers.watched_services(),
            active_health_checks,
            expiry_sweep_interval_secs: self.inner.config.expiry_sweep_interval_secs,
        }
    }

    // ─── Watchers ────────────────────────────────────────────────────────

    /// Invoke `callback` for every event concerning `service_name`.
    ///
    /// Callbacks are not deduplicated; watching twice means two invocations
    /// per event. A callback error or panic is logged and does not affect
    /// other watchers.
    ///
    /// Events are delivered one at a time in the order the changes happened.
    /// When another thread is already delivering, a mutating call may return
    /// before its own event has reached the watchers.
    pub fn watch_service<F>(&self, service_name: &str, callback: F)
    where
        F: Fn(ServiceEvent, &ServiceInstance) -> std::result::Result<(), WatchError>
            + Send
            + Sync
            + 'static,
    {
        self.inner.watchers.watch(service_name, Arc::new(callback));
    }

    /// Stream of every change event across all services.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceChange> {
        self.inner.watchers.subscribe()
    }

    // ─── Expiry ──────────────────────────────────────────────────────────

    /// Deregister every registration whose heartbeat is older than its TTL.
    /// Returns the expired ids.
    pub fn expire_stale_services(&self) -> Vec<String> {
        self.expire_stale_at(Utc::now())
    }

    pub(crate) fn expire_stale_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = {
            let table = self.inner.table();
            table
                .registrations
                .values()
                .filter(|reg| reg.is_expired_at(now))
                .map(|reg| reg.instance.service_id.clone())
                .collect()
        };

        stale
            .into_iter()
            .filter(|service_id| {
                let expired = self.deregister_if_stale(service_id, now);
                if expired {
                    info!(service_id = %service_id, "service expired after heartbeat ttl");
                }
                expired
            })
            .collect()
    }

    // ─── Health results ──────────────────────────────────────────────────

    /// Apply one probe outcome. Returns `false` when the loop that produced
    /// it should exit (registration gone or superseded).
    fn apply_probe_result(&self, service_id: &str, generation: u64, healthy: bool) -> bool {
        let transition = {
            let mut table = self.inner.table();
            let Some(registration) = table.registrations.get_mut(service_id) else {
                return false;
            };
            if registration.generation != generation {
                return false;
            }
            if healthy {
                registration.last_heartbeat = Utc::now();
            }
            let new_status = ServiceStatus::from_probe(healthy);
            if new_status == registration.status {
                None
            } else {
                let old_status = registration.status;
                registration.status = new_status;
                let event = ServiceEvent::for_transition(new_status);
                if let Some(event) = event {
                    self.inner.watchers.enqueue(event, &registration.instance);
                }
                let service_name = registration.instance.service_name.clone();
                event.map(|event| (event, old_status, service_name))
            }
        };

        if let Some((event, old_status, service_name)) = transition {
            info!(
                service_id = %service_id,
                service = %service_name,
                from = %old_status,
                to = %event,
                "service health changed"
            );
            self.inner.watchers.dispatch();
        }
        true
    }
}

impl std::fmt::Debug for ServiceDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDiscovery")
            .field("config", &self.inner.config)
            .field("running", &self.inner.is_running())
            .finish()
    }
}

/// Oldest registration first. Generations are monotonic per registry.
fn sort_by_registration(regs: &mut [&ServiceRegistration]) {
    regs.sort_by_key(|reg| reg.generation);
}
