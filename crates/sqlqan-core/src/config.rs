//! Collector configuration.

use std::time::Duration;

/// Interval between summary collections; buckets are aligned to multiples of it.
pub const DEFAULT_QUERY_INTERVAL: Duration = Duration::from_secs(60);

/// Summary retention. Long enough to cover daily queries and a truncation gap.
pub const DEFAULT_SUMMARY_RETAIN: Duration = Duration::from_secs(25 * 60 * 60);

/// History (example statement) retention.
pub const DEFAULT_HISTORY_RETAIN: Duration = Duration::from_secs(5 * 60);

/// Interval between history refreshes.
pub const DEFAULT_HISTORY_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Interval between history cleanup passes.
pub const DEFAULT_HISTORY_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Row limit for each cache.
pub const DEFAULT_CACHE_SIZE: usize = 10_000;

/// Maximum length of fingerprints and examples, in characters.
pub const DEFAULT_MAX_QUERY_LENGTH: usize = 2048;

/// Depth of the change channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10;

/// Configuration for [`Collector`](crate::collector::Collector).
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Identifier stamped onto every emitted bucket.
    pub agent_id: String,
    pub query_interval: Duration,
    pub summary_retain: Duration,
    pub history_retain: Duration,
    pub history_refresh_interval: Duration,
    pub history_cleanup_interval: Duration,
    pub summary_cache_size: usize,
    pub history_cache_size: usize,
    /// Zero disables truncation.
    pub max_query_length: usize,
    pub disable_query_examples: bool,
    /// Skip extracting `key='value'` tags from example comments.
    pub disable_comments_parsing: bool,
    pub channel_capacity: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            query_interval: DEFAULT_QUERY_INTERVAL,
            summary_retain: DEFAULT_SUMMARY_RETAIN,
            history_retain: DEFAULT_HISTORY_RETAIN,
            history_refresh_interval: DEFAULT_HISTORY_REFRESH_INTERVAL,
            history_cleanup_interval: DEFAULT_HISTORY_CLEANUP_INTERVAL,
            summary_cache_size: DEFAULT_CACHE_SIZE,
            history_cache_size: DEFAULT_CACHE_SIZE,
            max_query_length: DEFAULT_MAX_QUERY_LENGTH,
            disable_query_examples: false,
            disable_comments_parsing: false,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl CollectorConfig {
    /// Creates a configuration with defaults for the given agent.
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }

    /// Sets the summary collection interval.
    ///
    /// A zero interval is replaced by one second; wake-ups are aligned to
    /// multiples of this value on the wall clock.
    pub fn with_query_interval(mut self, interval: Duration) -> Self {
        self.query_interval = if interval.is_zero() {
            Duration::from_secs(1)
        } else {
            interval
        };
        self
    }

    pub fn with_summary_retain(mut self, retain: Duration) -> Self {
        self.summary_retain = retain;
        self
    }

    pub fn with_history_retain(mut self, retain: Duration) -> Self {
        self.history_retain = retain;
        self
    }

    /// Sets the history refresh and cleanup cadences.
    pub fn with_history_intervals(mut self, refresh: Duration, cleanup: Duration) -> Self {
        self.history_refresh_interval = refresh;
        self.history_cleanup_interval = cleanup;
        self
    }

    pub fn with_cache_sizes(mut self, summary: usize, history: usize) -> Self {
        self.summary_cache_size = summary;
        self.history_cache_size = history;
        self
    }

    pub fn with_max_query_length(mut self, max_len: usize) -> Self {
        self.max_query_length = max_len;
        self
    }

    pub fn with_query_examples_disabled(mut self, disabled: bool) -> Self {
        self.disable_query_examples = disabled;
        self
    }

    pub fn with_comments_parsing_disabled(mut self, disabled: bool) -> Self {
        self.disable_comments_parsing = disabled;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}
