//! Background removal of idle keys.
//!
//! The limiter never drops keys on its own. A host process with unbounded
//! key cardinality (for example keys derived from source addresses) can
//! spawn this task to bound memory.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::limiter::RateLimiter;

/// Spawn a task that calls [`RateLimiter::reap_idle`] every `interval`,
/// removing keys idle for longer than `horizon`.
///
/// The task runs until the returned handle is aborted or the runtime stops.
pub fn spawn_reaper(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    horizon: Duration,
) -> JoinHandle<()> {
    info!(
        interval_secs = interval.as_secs_f64(),
        horizon_secs = horizon.as_secs(),
        "Starting idle key reaper"
    );

    // tokio panics on a zero period.
    let interval = interval.max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = limiter.reap_idle(horizon.as_secs());
            debug!(removed = removed, keys = limiter.key_count(), "Reaper sweep finished");
        }
    })
}
