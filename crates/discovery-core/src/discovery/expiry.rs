use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Weak;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use super::{Inner, ServiceDiscovery};

/// Periodically deregister registrations whose heartbeat outlived their TTL.
///
/// The first sweep runs one `interval` after start. A failing sweep is logged
/// and the next one still runs.
pub(super) async fn run(inner: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let discovery = match inner.upgrade() {
            Some(inner) if inner.is_running() => ServiceDiscovery { inner },
            _ => break,
        };

        match catch_unwind(AssertUnwindSafe(|| discovery.expire_stale_services())) {
            Ok(expired) if expired.is_empty() => debug!("expiry sweep found nothing stale"),
            Ok(expired) => info!(count = expired.len(), ?expired, "expiry sweep removed services"),
            Err(_) => error!("expiry sweep panicked; retrying next interval"),
        }
    }

    debug!("expiry sweep exited");
}
