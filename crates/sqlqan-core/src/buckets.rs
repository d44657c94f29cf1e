//! Delta engine: turns two cumulative digest snapshots into per-period buckets.
//!
//! [`make_buckets`] is pure; the collector feeds it the fresh snapshot and the
//! summary cache contents and stamps period/agent fields afterwards.
//!
//! Per digest of `current`:
//! - execution count unchanged → no bucket. A truncation followed by exactly the
//!   same number of executions looks identical and is dropped too.
//! - execution count went down → counters were reset; the previous state is
//!   replaced by zeroes and the digest is reported as new.
//! - no previous state → new digest, diffed against zeroes.
//!
//! Digests only present in `prev` produce nothing. Output order is unspecified.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::model::{DigestSummary, Metric, MetricStat, MetricsBucket, SummaryMap};

// ---------------------------------------------------------------------------
// Delta helpers
// ---------------------------------------------------------------------------

/// Counter increment, `None` on regression.
pub fn du64(curr: u64, prev: u64) -> Option<u64> {
    curr.checked_sub(prev)
}

/// How a digest's delta was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    /// Same execution count as before; skipped.
    Unchanged,
    /// Execution count decreased: statistics were truncated or the server restarted.
    Reset,
    /// No previous state.
    New,
    Normal,
}

/// Classifies `curr` against its previous state.
pub fn classify(curr: &DigestSummary, prev: Option<&DigestSummary>) -> DeltaKind {
    let prev_count = prev.map_or(0, |p| p.count_star);
    if curr.count_star == prev_count {
        DeltaKind::Unchanged
    } else if curr.count_star < prev_count {
        DeltaKind::Reset
    } else if prev_count == 0 {
        DeltaKind::New
    } else {
        DeltaKind::Normal
    }
}

// ---------------------------------------------------------------------------
// Bucket construction
// ---------------------------------------------------------------------------

/// Builds one bucket per digest of `current` whose execution count changed.
pub fn make_buckets(current: &SummaryMap, prev: &SummaryMap) -> Vec<MetricsBucket> {
    let zero = DigestSummary::default();
    let mut res = Vec::with_capacity(current.len());

    for (digest, curr) in current {
        let prev_entry = prev.get(digest);
        let base = match classify(curr, prev_entry) {
            DeltaKind::Unchanged => {
                trace!(digest = %digest, "skipped due to the same number of queries");
                continue;
            }
            DeltaKind::Reset => {
                debug!(digest = %digest, "truncate detected, treating as a new query");
                &zero
            }
            DeltaKind::New => {
                debug!(digest = %digest, "new query");
                &zero
            }
            DeltaKind::Normal => {
                trace!(digest = %digest, "normal query");
                prev_entry.unwrap_or(&zero)
            }
        };

        res.push(bucket_from_delta(curr, base));
    }

    res
}

/// Builds the bucket for `curr` diffed against `base`.
///
/// `curr.count_star` must be greater than `base.count_star`.
fn bucket_from_delta(curr: &DigestSummary, base: &DigestSummary) -> MetricsBucket {
    let count = (curr.count_star - base.count_star) as f32;

    let mut metrics = BTreeMap::new();
    for metric in Metric::ALL {
        let Some(delta) = du64(metric.counter(curr), metric.counter(base)) else {
            continue;
        };
        if delta == 0 {
            continue;
        }
        metrics.insert(
            metric,
            MetricStat {
                sum: (delta as f64 / metric.divisor()) as f32,
                cnt: count,
            },
        );
    }

    MetricsBucket {
        queryid: curr.digest.clone(),
        fingerprint: curr.digest_text.clone(),
        schema: curr.schema_name.clone().unwrap_or_default(),
        num_queries: count,
        num_queries_with_errors: du64(curr.sum_errors, base.sum_errors).unwrap_or(0) as f32,
        num_queries_with_warnings: du64(curr.sum_warnings, base.sum_warnings).unwrap_or(0) as f32,
        metrics,
        ..MetricsBucket::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
