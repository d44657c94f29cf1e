//! Shared building blocks for the digest caches: timestamped entries,
//! age-based eviction, size trimming and statistics.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Cached value with the time it was last inserted or overwritten.
///
/// The timestamp is used only for eviction.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub inserted_at: Instant,
}

/// Lookup counters, kept only by caches that serve point lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupStats {
    pub hits: u64,
    pub misses: u64,
}

/// Point-in-time counters of a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently held.
    pub current: usize,
    /// Row limit; zero means unlimited.
    pub size_limit: usize,
    pub added: u64,
    pub updated: u64,
    /// Entries evicted by age.
    pub removed: u64,
    /// Entries dropped because the row limit was exceeded.
    pub trimmed: u64,
    /// `None` for the Summary Cache, which is always read whole.
    pub lookups: Option<LookupStats>,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "current={}/{} added={} updated={} removed={} trimmed={}",
            self.current, self.size_limit, self.added, self.updated, self.removed, self.trimmed
        )?;
        if let Some(lookups) = self.lookups {
            write!(f, " hits={} misses={}", lookups.hits, lookups.misses)?;
        }
        Ok(())
    }
}

/// Digest-keyed map of timestamped entries. Callers provide the locking.
#[derive(Debug)]
pub(crate) struct TimedMap<T> {
    entries: HashMap<String, CacheEntry<T>>,
    size_limit: usize,
    stats: CacheStats,
}

impl<T: Clone> TimedMap<T> {
    pub(crate) fn new(size_limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            size_limit,
            stats: CacheStats {
                size_limit,
                ..CacheStats::default()
            },
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub(crate) fn size_limit(&self) -> usize {
        self.size_limit
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Copies all values regardless of age.
    pub(crate) fn snapshot(&self) -> HashMap<String, T> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Removes entries whose age at `now` exceeds `retain`. Returns the count removed.
    pub(crate) fn evict_older_than(&mut self, now: Instant, retain: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.inserted_at) <= retain);
        let removed = before - self.entries.len();
        self.stats.removed += removed as u64;
        removed
    }

    /// Inserts or overwrites an entry, stamping it with `now`.
    pub(crate) fn upsert(&mut self, key: String, value: T, now: Instant) {
        let entry = CacheEntry {
            value,
            inserted_at: now,
        };
        if self.entries.insert(key, entry).is_some() {
            self.stats.updated += 1;
        } else {
            self.stats.added += 1;
        }
    }

    /// Drops the oldest entries until the row limit holds.
    ///
    /// Entries stamped at or after `keep_since` are never dropped, so a refresh
    /// larger than the limit keeps all of its own rows and the map stays over
    /// the limit until they age.
    pub(crate) fn trim(&mut self, keep_since: Instant) -> usize {
        if self.size_limit == 0 || self.entries.len() <= self.size_limit {
            return 0;
        }
        let excess = self.entries.len() - self.size_limit;
        let mut by_age: Vec<(Instant, String)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.inserted_at < keep_since)
            .map(|(k, e)| (e.inserted_at, k.clone()))
            .collect();
        by_age.sort();
        by_age.truncate(excess);
        for (_, key) in &by_age {
            self.entries.remove(key);
        }
        self.stats.trimmed += by_age.len() as u64;
        by_age.len()
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            current: self.entries.len(),
            ..self.stats
        }
    }

    #[cfg(test)]
    pub(crate) fn inserted_at(&self, key: &str) -> Option<Instant> {
        self.entries.get(key).map(|e| e.inserted_at)
    }
}
