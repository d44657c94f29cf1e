//! Cache of the most recently observed cumulative counters per digest.
//!
//! This is the "previous" side of every delta computation. Retention is much
//! longer than the polling interval: a digest that briefly disappears from the
//! statistics table (missed poll, truncation) keeps its last counters so it is
//! not reported again as brand-new with inflated deltas.

use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cache::{CacheStats, TimedMap};
use crate::model::{DigestSummary, SummaryMap};

/// Long-lived digest → counters cache.
#[derive(Debug)]
pub struct SummaryCache {
    retain: Duration,
    inner: RwLock<TimedMap<DigestSummary>>,
}

impl SummaryCache {
    /// Creates an empty cache. `size_limit` of zero disables trimming.
    pub fn new(retain: Duration, size_limit: usize) -> Self {
        Self {
            retain,
            inner: RwLock::new(TimedMap::new(size_limit)),
        }
    }

    pub fn retain(&self) -> Duration {
        self.retain
    }

    /// Returns a copy of every held entry, regardless of age.
    ///
    /// Age filtering happens only in [`refresh`](Self::refresh), so the result is
    /// always the complete previous state.
    pub fn get(&self) -> SummaryMap {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Evicts expired entries, then merges `current` in, stamping it with now.
    pub fn refresh(&self, current: &SummaryMap) {
        self.refresh_at(current, Instant::now());
    }

    /// Same as [`refresh`](Self::refresh) with an explicit clock reading.
    pub fn refresh_at(&self, current: &SummaryMap, now: Instant) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.evict_older_than(now, self.retain);
        for (digest, summary) in current {
            inner.upsert(digest.clone(), summary.clone(), now);
        }
        if inner.size_limit() != 0 && current.len() > inner.size_limit() {
            warn!(
                digests = current.len(),
                size_limit = inner.size_limit(),
                "snapshot exceeds summary cache size limit, keeping all of it"
            );
        }
        let trimmed = inner.trim(now);
        if removed > 0 || trimmed > 0 {
            debug!(removed, trimmed, "summary cache evicted entries");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .stats()
    }
}
