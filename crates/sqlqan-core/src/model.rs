//! Data model: cumulative digest summaries, history samples and emitted buckets.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Snapshot of cumulative counters keyed by digest.
pub type SummaryMap = HashMap<String, DigestSummary>;

/// Snapshot of recent example statements keyed by digest.
pub type HistoryMap = HashMap<String, HistoryEvent>;

/// Picoseconds per second. Timer counters are stored in picoseconds upstream.
pub const PICOSECONDS_PER_SECOND: f64 = 1e12;

/// Cumulative statistics for one normalized statement.
///
/// Counter layout follows `performance_schema.events_statements_summary_by_digest`.
/// All counters are non-decreasing until the statistics table is reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DigestSummary {
    /// Stable hash of the normalized statement. Key for delta computation.
    pub digest: String,

    /// Normalized statement text with literals replaced.
    pub digest_text: String,

    /// Default schema/database the statement ran in.
    #[serde(default)]
    pub schema_name: Option<String>,

    /// Number of executions.
    pub count_star: u64,

    /// Total execution time (picoseconds).
    pub sum_timer_wait: u64,

    /// Total time spent waiting for table locks (picoseconds).
    pub sum_lock_time: u64,

    pub sum_errors: u64,
    pub sum_warnings: u64,
    pub sum_rows_affected: u64,
    pub sum_rows_sent: u64,
    pub sum_rows_examined: u64,
    pub sum_created_tmp_disk_tables: u64,
    pub sum_created_tmp_tables: u64,
    pub sum_select_full_join: u64,
    pub sum_select_full_range_join: u64,
    pub sum_select_range: u64,
    pub sum_select_range_check: u64,
    pub sum_select_scan: u64,
    pub sum_sort_merge_passes: u64,
    pub sum_sort_range: u64,
    pub sum_sort_rows: u64,
    pub sum_sort_scan: u64,
    pub sum_no_index_used: u64,
    pub sum_no_good_index_used: u64,
}

/// Most recent literal example of a digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub digest: String,
    /// Literal statement text as executed.
    pub sql_text: Option<String>,
    /// Schema active when the statement executed.
    pub current_schema: Option<String>,
}

/// Per-statement metric tracked in a bucket as a sum/count pair.
///
/// Ordered the same as the summary table columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    QueryTime,
    LockTime,
    RowsAffected,
    RowsSent,
    RowsExamined,
    TmpDiskTables,
    TmpTables,
    FullJoin,
    SelectFullRangeJoin,
    SelectRange,
    SelectRangeCheck,
    FullScan,
    MergePasses,
    SortRange,
    SortRows,
    SortScan,
    NoIndexUsed,
    NoGoodIndexUsed,
}

impl Metric {
    pub const ALL: [Metric; 18] = [
        Metric::QueryTime,
        Metric::LockTime,
        Metric::RowsAffected,
        Metric::RowsSent,
        Metric::RowsExamined,
        Metric::TmpDiskTables,
        Metric::TmpTables,
        Metric::FullJoin,
        Metric::SelectFullRangeJoin,
        Metric::SelectRange,
        Metric::SelectRangeCheck,
        Metric::FullScan,
        Metric::MergePasses,
        Metric::SortRange,
        Metric::SortRows,
        Metric::SortScan,
        Metric::NoIndexUsed,
        Metric::NoGoodIndexUsed,
    ];

    /// Reads the cumulative counter backing this metric.
    pub fn counter(self, s: &DigestSummary) -> u64 {
        match self {
            Metric::QueryTime => s.sum_timer_wait,
            Metric::LockTime => s.sum_lock_time,
            Metric::RowsAffected => s.sum_rows_affected,
            Metric::RowsSent => s.sum_rows_sent,
            Metric::RowsExamined => s.sum_rows_examined,
            Metric::TmpDiskTables => s.sum_created_tmp_disk_tables,
            Metric::TmpTables => s.sum_created_tmp_tables,
            Metric::FullJoin => s.sum_select_full_join,
            Metric::SelectFullRangeJoin => s.sum_select_full_range_join,
            Metric::SelectRange => s.sum_select_range,
            Metric::SelectRangeCheck => s.sum_select_range_check,
            Metric::FullScan => s.sum_select_scan,
            Metric::MergePasses => s.sum_sort_merge_passes,
            Metric::SortRange => s.sum_sort_range,
            Metric::SortRows => s.sum_sort_rows,
            Metric::SortScan => s.sum_sort_scan,
            Metric::NoIndexUsed => s.sum_no_index_used,
            Metric::NoGoodIndexUsed => s.sum_no_good_index_used,
        }
    }

    /// Divisor applied to a counter delta to get the emitted value.
    pub fn divisor(self) -> f64 {
        match self {
            Metric::QueryTime | Metric::LockTime => PICOSECONDS_PER_SECOND,
            _ => 1.0,
        }
    }
}

/// Sum of a metric over the period and the number of executions it covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricStat {
    pub sum: f32,
    pub cnt: f32,
}

/// How an attached example should be interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExampleFormat {
    #[default]
    Example,
    Fingerprint,
}

/// How an attached example was selected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExampleType {
    #[default]
    Random,
    Slowest,
    Fastest,
}

/// Literal statement attached to a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryExample {
    pub text: String,
    pub format: ExampleFormat,
    pub kind: ExampleType,
}

/// Per-period delta for one digest.
///
/// Only metrics with a non-zero delta are present in `metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsBucket {
    pub queryid: String,
    pub fingerprint: String,
    pub schema: String,
    pub agent_id: String,
    pub period_start_unix_secs: i64,
    pub period_length_secs: u32,
    /// Fingerprint or example text was cut to the configured length.
    pub is_truncated: bool,
    pub num_queries: f32,
    pub num_queries_with_errors: f32,
    pub num_queries_with_warnings: f32,
    pub metrics: BTreeMap<Metric, MetricStat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<QueryExample>,
    /// Tags parsed from comments of the example statement.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub comments: BTreeMap<String, String>,
}

impl MetricsBucket {
    /// Returns the sum/count pair for a metric, if its delta was non-zero.
    pub fn metric(&self, metric: Metric) -> Option<MetricStat> {
        self.metrics.get(&metric).copied()
    }
}
