use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::error::WatchError;
use crate::types::{ServiceEvent, ServiceInstance};

/// Callback invoked with every change to a watched service name.
pub type WatchCallback =
    Arc<dyn Fn(ServiceEvent, &ServiceInstance) -> Result<(), WatchError> + Send + Sync>;

/// One change event, as published on the broadcast stream.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceChange {
    pub event: ServiceEvent,
    pub instance: ServiceInstance,
    pub at: DateTime<Utc>,
}

// ─── WatcherRegistry ──────────────────────────────────────────────────────

/// Fans change notifications out to per-service callbacks and to any
/// broadcast subscribers.
///
/// Callbacks are not deduplicated: registering the same callback twice means
/// it runs twice per event.
///
/// Changes are queued with [`enqueue`](Self::enqueue) and delivered by
/// [`dispatch`](Self::dispatch) strictly in queue order. Only one thread
/// delivers at a time, so a caller that enqueues while holding its own lock
/// fixes the order every watcher and subscriber observes.
pub struct WatcherRegistry {
    watchers: Mutex<HashMap<String, Vec<WatchCallback>>>,
    events: broadcast::Sender<ServiceChange>,
    /// Changes not yet delivered, oldest first.
    pending: Mutex<VecDeque<ServiceChange>>,
    /// Held by the thread currently draining `pending`.
    dispatching: Mutex<()>,
}

impl WatcherRegistry {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            watchers: Mutex::new(HashMap::new()),
            events,
            pending: Mutex::new(VecDeque::new()),
            dispatching: Mutex::new(()),
        }
    }

    pub fn watch(&self, service_name: &str, callback: WatchCallback) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        watchers
            .entry(service_name.to_string())
            .or_default()
            .push(callback);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceChange> {
        self.events.subscribe()
    }

    /// Number of callbacks registered for `service_name`.
    #[cfg(test)]
    pub(crate) fn watcher_count(&self, service_name: &str) -> usize {
        let watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        watchers.get(service_name).map_or(0, Vec::len)
    }

    pub fn watched_services(&self) -> Vec<String> {
        let watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = watchers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Queue `event` and deliver everything pending.
    #[cfg(test)]
    pub(crate) fn notify(&self, event: ServiceEvent, instance: &ServiceInstance) {
        self.enqueue(event, instance);
        self.dispatch();
    }

    /// Queue `event` for delivery without running any callback.
    pub fn enqueue(&self, event: ServiceEvent, instance: &ServiceInstance) {
        self.pending().push_back(ServiceChange {
            event,
            instance: instance.clone(),
            at: Utc::now(),
        });
    }

    /// Deliver every queued change in order.
    ///
    /// Returns immediately when another call is already delivering, including
    /// a callback that re-enters the registry; the active call then delivers
    /// the newly queued changes after the ones ahead of them.
    pub fn dispatch(&self) {
        loop {
            let guard = match self.dispatching.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            while let Some(change) = self.next_pending() {
                self.deliver(change);
            }
            drop(guard);

            // A change queued after the drain but before the unlock found the
            // lock taken; pick it up here.
            if self.pending().is_empty() {
                return;
            }
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<ServiceChange>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_pending(&self) -> Option<ServiceChange> {
        self.pending().pop_front()
    }

    /// Run every watcher of the change's service name, then publish it.
    ///
    /// Each callback is isolated: an error or panic is logged and the
    /// remaining callbacks still run. Callbacks are invoked without holding
    /// any registry lock, so they may register further watchers.
    fn deliver(&self, change: ServiceChange) {
        let event = change.event;
        let instance = &change.instance;
        let callbacks: Vec<WatchCallback> = {
            let watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
            watchers
                .get(&instance.service_name)
                .cloned()
                .unwrap_or_default()
        };

        for callback in &callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(event, instance))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    service = %instance.service_name,
                    service_id = %instance.service_id,
                    %event,
                    error = %e,
                    "watcher callback failed"
                ),
                Err(_) => error!(
                    service = %instance.service_name,
                    service_id = %instance.service_id,
                    %event,
                    "watcher callback panicked"
                ),
            }
        }

        // No receivers is the common case; ignore the send error.
        let _ = self.events.send(change);
    }
}

impl std::fmt::Debug for WatcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherRegistry")
            .field("watched_services", &self.watched_services())
            .finish()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
