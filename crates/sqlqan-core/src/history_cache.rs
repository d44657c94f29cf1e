//! Short-lived cache of example statements per digest.
//!
//! Kept warm by the history refresher loop; entries age out after `retain`,
//! which must stay above the refresh interval. A lookup miss triggers one
//! synchronous refresh from the Row Source before giving up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cache::{CacheStats, LookupStats, TimedMap};
use crate::error::SourceError;
use crate::model::{HistoryEvent, HistoryMap};
use crate::source::RowSource;

/// By default every miss refreshes; concurrent misses still share one refresh.
pub const DEFAULT_MISS_REFRESH_COOLDOWN: Duration = Duration::ZERO;

/// Digest → most recent example statement.
pub struct HistoryCache {
    source: Arc<dyn RowSource>,
    retain: Duration,
    inner: RwLock<TimedMap<HistoryEvent>>,
    /// Serializes refreshes so concurrent misses share one round-trip.
    /// Holds the completion time of the last successful refresh.
    refresh_guard: Mutex<Option<Instant>>,
    miss_refresh_cooldown: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HistoryCache {
    pub fn new(source: Arc<dyn RowSource>, retain: Duration, size_limit: usize) -> Self {
        Self {
            source,
            retain,
            inner: RwLock::new(TimedMap::new(size_limit)),
            refresh_guard: Mutex::new(None),
            miss_refresh_cooldown: DEFAULT_MISS_REFRESH_COOLDOWN,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Opts into answering misses from the cache alone for `cooldown` after a
    /// successful refresh. Zero (the default) refreshes on every miss.
    pub fn with_miss_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.miss_refresh_cooldown = cooldown;
        self
    }

    pub fn retain(&self) -> Duration {
        self.retain
    }

    fn lookup(&self, digest: &str) -> Option<HistoryEvent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(digest)
            .cloned()
    }

    /// Returns the cached example for `digest`.
    ///
    /// On a miss the cache is refreshed once and the lookup retried, unless a
    /// refresh finished less than the miss cooldown ago. A failed refresh is
    /// logged and reported as absent.
    pub fn get(&self, digest: &str) -> Option<HistoryEvent> {
        if let Some(event) = self.lookup(digest) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(event);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let mut last_refresh = self
            .refresh_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Another caller may have refreshed while we waited.
        if let Some(event) = self.lookup(digest) {
            return Some(event);
        }
        if let Some(at) = *last_refresh
            && at.elapsed() < self.miss_refresh_cooldown
        {
            return None;
        }
        match self.fetch_and_merge() {
            Ok(_) => *last_refresh = Some(Instant::now()),
            Err(e) => debug!(digest = %digest, error = %e, "history refresh on miss failed"),
        }
        self.lookup(digest)
    }

    /// Reads the full history from the Row Source and merges it in.
    ///
    /// Returns the number of events read.
    pub fn refresh(&self) -> Result<usize, SourceError> {
        let mut last_refresh = self
            .refresh_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let n = self.fetch_and_merge()?;
        *last_refresh = Some(Instant::now());
        Ok(n)
    }

    fn fetch_and_merge(&self) -> Result<usize, SourceError> {
        let current = self.source.fetch_history()?;
        let n = current.len();
        self.merge_at(&current, Instant::now());
        Ok(n)
    }

    /// Inserts/overwrites every event of `current`, stamped with `now`.
    pub fn merge_at(&self, current: &HistoryMap, now: Instant) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for (digest, event) in current {
            inner.upsert(digest.clone(), event.clone(), now);
        }
        inner.trim(now);
    }

    /// Removes entries older than the retention. Returns the count removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .evict_older_than(now, self.retain)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .stats();
        stats.lookups = Some(LookupStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        });
        stats
    }
}
