use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use super::{Inner, ServiceDiscovery};

/// Probe one registration every `interval` until it is deregistered,
/// superseded by a re-registration, or the registry stops.
///
/// The first probe runs immediately. A panicking probe counts as a failed
/// check for that cycle; it never ends the loop.
pub(super) async fn run(
    inner: Weak<Inner>,
    service_id: String,
    generation: u64,
    url: String,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        // Hold only the probe across the await so dropping the registry is
        // never delayed by an in-flight check.
        let probe = match inner.upgrade() {
            Some(inner) if inner.is_running() => Arc::clone(&inner.probe),
            _ => break,
        };

        let healthy = match AssertUnwindSafe(probe.check(Some(url.as_str())))
            .catch_unwind()
            .await
        {
            Ok(healthy) => healthy,
            Err(_) => {
                error!(service_id = %service_id, url = %url, "health probe panicked");
                false
            }
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let discovery = ServiceDiscovery { inner };
        if !discovery.apply_probe_result(&service_id, generation, healthy) {
            break;
        }
    }

    debug!(service_id = %service_id, "health check loop exited");
}
