//! Scripted in-memory Row Source for testing and demo runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::SourceError;
use crate::model::{DigestSummary, HistoryEvent, HistoryMap, SummaryMap};

use super::RowSource;

#[derive(Debug, Default)]
struct MockState {
    summaries: SummaryMap,
    history: HistoryMap,
    summary_failures: VecDeque<SourceError>,
    history_failures: VecDeque<SourceError>,
    /// Executions added to every digest on each summary fetch.
    workload_step: u64,
}

/// Row Source backed by in-memory maps.
///
/// Tests replace the maps between ticks and queue one-shot failures. With a
/// non-zero workload step every summary fetch also advances all counters,
/// which simulates a live server.
#[derive(Debug, Default)]
pub struct MockSource {
    state: Mutex<MockState>,
    summary_calls: AtomicUsize,
    history_calls: AtomicUsize,
}

impl MockSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source with a few digests whose counters grow on every fetch.
    pub fn typical_workload() -> Self {
        let source = Self::new();
        let statements = [
            (
                "3f2a9c1e",
                "SELECT * FROM `orders` WHERE `id` = ?",
                "shop",
                "SELECT * FROM orders WHERE id = 42",
            ),
            (
                "7b01d4aa",
                "UPDATE `stock` SET `qty` = `qty` - ? WHERE `sku` = ?",
                "shop",
                "UPDATE stock SET qty = qty - 1 WHERE sku = 'A-1'",
            ),
            (
                "c9e87f30",
                "SELECT COUNT ( * ) FROM `sessions`",
                "auth",
                "SELECT COUNT(*) FROM sessions",
            ),
        ];
        {
            let mut state = source.lock();
            for (digest, text, schema, example) in statements {
                state.summaries.insert(
                    digest.to_string(),
                    DigestSummary {
                        digest: digest.to_string(),
                        digest_text: text.to_string(),
                        schema_name: Some(schema.to_string()),
                        ..Default::default()
                    },
                );
                state.history.insert(
                    digest.to_string(),
                    HistoryEvent {
                        digest: digest.to_string(),
                        sql_text: Some(example.to_string()),
                        current_schema: Some(schema.to_string()),
                    },
                );
            }
            state.workload_step = 10;
        }
        source
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the summary table contents.
    pub fn set_summaries(&self, summaries: SummaryMap) {
        self.lock().summaries = summaries;
    }

    /// Replaces the history table contents.
    pub fn set_history(&self, history: HistoryMap) {
        self.lock().history = history;
    }

    /// Makes the next summary fetch fail with `err`.
    pub fn fail_summaries_once(&self, err: SourceError) {
        self.lock().summary_failures.push_back(err);
    }

    /// Makes the next history fetch fail with `err`.
    pub fn fail_history_once(&self, err: SourceError) {
        self.lock().history_failures.push_back(err);
    }

    pub fn summary_calls(&self) -> usize {
        self.summary_calls.load(Ordering::SeqCst)
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }
}

impl RowSource for MockSource {
    fn fetch_summaries(&self) -> Result<SummaryMap, SourceError> {
        self.summary_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if let Some(err) = state.summary_failures.pop_front() {
            return Err(err);
        }
        let step = state.workload_step;
        if step > 0 {
            for s in state.summaries.values_mut() {
                s.count_star += step;
                s.sum_timer_wait += step * 1_500_000_000;
                s.sum_rows_sent += step * 3;
                s.sum_rows_examined += step * 120;
            }
        }
        Ok(state.summaries.clone())
    }

    fn fetch_history(&self) -> Result<HistoryMap, SourceError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if let Some(err) = state.history_failures.pop_front() {
            return Err(err);
        }
        Ok(state.history.clone())
    }
}
