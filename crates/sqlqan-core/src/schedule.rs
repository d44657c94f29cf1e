//! Wall-clock aligned scheduling.
//!
//! Collections happen on multiples of the interval since the Unix epoch (the
//! top of every minute for the default interval), so consecutive periods stay
//! contiguous regardless of how long each collection takes.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of wall-clock time for period alignment.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Time from `now` until the next multiple of `interval`.
///
/// Never zero: exactly on a boundary, the following boundary is returned.
pub fn wait_until_next_boundary(now: DateTime<Utc>, interval: Duration) -> Duration {
    let interval_ms = (interval.as_millis() as i64).max(1);
    let now_ms = now.timestamp_millis();
    let next_ms = (now_ms.div_euclid(interval_ms) + 1) * interval_ms;
    Duration::from_millis((next_ms - now_ms) as u64)
}

/// Period length in whole seconds; 59.9s and 60.1s both become 60.
pub fn period_length_secs(wait: Duration) -> u32 {
    wait.as_secs_f64().round() as u32
}
