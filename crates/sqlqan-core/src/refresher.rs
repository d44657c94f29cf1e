//! Background loops keeping the History Cache warm and bounded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::history_cache::HistoryCache;

// ============================================================
// History refresh
// ============================================================

/// Refreshes `cache` from its Row Source every `interval` until cancelled.
///
/// The first refresh happens immediately. Failures are logged and retried on
/// the next tick.
pub async fn run_history_refresher(
    cache: Arc<HistoryCache>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval.max(Duration::from_millis(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let cache = cache.clone();
        let t0 = Instant::now();
        let result = tokio::task::spawn_blocking(move || cache.refresh()).await;
        let duration_ms = t0.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(events)) => debug!(events, duration_ms, "history refreshed"),
            Ok(Err(e)) => warn!(error = %e, duration_ms, "history refresh failed"),
            Err(e) => error!(error = %e, "history refresh panicked in spawn_blocking"),
        }
    }

    debug!("history refresher stopped");
}

// ============================================================
// History cleanup
// ============================================================

/// Evicts aged-out history entries every `interval` until cancelled.
pub async fn run_history_cleanup(
    cache: Arc<HistoryCache>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let interval = interval.max(Duration::from_millis(1));
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let removed = cache.cleanup();
        if removed > 0 {
            debug!(removed, stats = %cache.stats(), "history cleanup");
        }
    }

    debug!("history cleanup stopped");
}
