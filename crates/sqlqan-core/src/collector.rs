//! Collector loop: polls digest summaries on wall-clock boundaries and emits
//! per-period buckets together with health status changes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buckets::make_buckets;
use crate::comments::parse_comments;
use crate::config::CollectorConfig;
use crate::error::SourceError;
use crate::history_cache::HistoryCache;
use crate::model::{ExampleFormat, ExampleType, MetricsBucket, QueryExample, SummaryMap};
use crate::refresher::{run_history_cleanup, run_history_refresher};
use crate::schedule::{Clock, SystemClock, period_length_secs, wait_until_next_boundary};
use crate::source::RowSource;
use crate::status::{AgentStatus, Change};
use crate::summary_cache::SummaryCache;
use crate::truncate::truncate_query;

/// Owns both caches and drives the collection loop.
///
/// Cheap to clone; clones share the caches and the Row Source.
#[derive(Clone)]
pub struct Collector {
    config: CollectorConfig,
    source: Arc<dyn RowSource>,
    summary_cache: Arc<SummaryCache>,
    history_cache: Arc<HistoryCache>,
    clock: Arc<dyn Clock>,
}

impl Collector {
    pub fn new(source: Arc<dyn RowSource>, config: CollectorConfig) -> Self {
        let summary_cache = Arc::new(SummaryCache::new(
            config.summary_retain,
            config.summary_cache_size,
        ));
        let history_cache = Arc::new(HistoryCache::new(
            source.clone(),
            config.history_retain,
            config.history_cache_size,
        ));
        Self {
            config,
            source,
            summary_cache,
            history_cache,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the wall clock used to align and stamp periods.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn summary_cache(&self) -> &Arc<SummaryCache> {
        &self.summary_cache
    }

    pub fn history_cache(&self) -> &Arc<HistoryCache> {
        &self.history_cache
    }

    /// Spawns the collector on the current tokio runtime.
    ///
    /// The receiver yields status changes and batches; it ends after
    /// [`AgentStatus::Done`] once `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> (mpsc::Receiver<Change>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let handle = tokio::spawn(self.run(tx, cancel));
        (rx, handle)
    }

    /// Runs until `cancel` fires or the receiver is dropped.
    ///
    /// Emits `STOPPING` then `DONE` before returning; `tx` is dropped on return,
    /// which closes the stream.
    pub async fn run(self, tx: mpsc::Sender<Change>, cancel: CancellationToken) {
        let loops = cancel.child_token();
        tokio::spawn(run_history_refresher(
            self.history_cache.clone(),
            self.config.history_refresh_interval,
            loops.clone(),
        ));
        tokio::spawn(run_history_cleanup(
            self.history_cache.clone(),
            self.config.history_cleanup_interval,
            loops.clone(),
        ));

        self.collect_loop(&tx, &cancel).await;
        loops.cancel();

        info!(agent_id = %self.config.agent_id, "collector stopping");
        for status in [AgentStatus::Stopping, AgentStatus::Done] {
            if tx.send(Change::StatusChanged(status)).await.is_err() {
                debug!(status = %status, "change receiver dropped");
                break;
            }
        }
    }

    async fn collect_loop(&self, tx: &mpsc::Sender<Change>, cancel: &CancellationToken) {
        let interval = self.config.query_interval;

        if !emit(tx, cancel, Change::StatusChanged(AgentStatus::Starting)).await {
            return;
        }

        // Seed the cache so the first period is not diffed against nothing.
        let mut running = match self.fetch_summaries().await {
            Ok(initial) => {
                info!(digests = initial.len(), "initial summaries collected");
                self.summary_cache.refresh(&initial);
                true
            }
            Err(e) => {
                error!(error = %e, "initial summaries collection failed");
                false
            }
        };
        let status = if running {
            AgentStatus::Running
        } else {
            AgentStatus::Waiting
        };
        if !emit(tx, cancel, Change::StatusChanged(status)).await {
            return;
        }

        let mut start = self.clock.now();
        let mut wait = wait_until_next_boundary(start, interval);
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);
        let mut batch_count: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = &mut sleep => {}
            }

            if !running && !emit(tx, cancel, Change::StatusChanged(AgentStatus::Starting)).await {
                return;
            }

            let period_start = start;
            let length = period_length_secs(wait);
            let t0 = Instant::now();
            let result = self.fetch_summaries().await;

            start = self.clock.now();
            wait = wait_until_next_boundary(start, interval);
            sleep.as_mut().reset(tokio::time::Instant::now() + wait);

            let current = match result {
                Ok(current) => current,
                Err(e) => {
                    warn!(error = %e, "summaries collection failed");
                    running = false;
                    if !emit(tx, cancel, Change::StatusChanged(AgentStatus::Waiting)).await {
                        return;
                    }
                    continue;
                }
            };

            if !running {
                running = true;
                if !emit(tx, cancel, Change::StatusChanged(AgentStatus::Running)).await {
                    return;
                }
            }

            let this = self.clone();
            let batch = match tokio::task::spawn_blocking(move || {
                this.build_batch(&current, period_start, length)
            })
            .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "batch build panicked in spawn_blocking");
                    continue;
                }
            };

            batch_count += 1;
            let duration_ms = t0.elapsed().as_millis() as u64;
            if batch_count == 1 {
                info!(
                    buckets = batch.len(),
                    duration_ms,
                    period_length_secs = length,
                    "first batch collected"
                );
            } else {
                debug!(
                    buckets = batch.len(),
                    duration_ms,
                    period_length_secs = length,
                    batch_count,
                    "batch collected"
                );
            }

            if !emit(tx, cancel, Change::MetricsEmitted(batch)).await {
                return;
            }
        }
    }

    async fn fetch_summaries(&self) -> Result<SummaryMap, SourceError> {
        let source = self.source.clone();
        tokio::task::spawn_blocking(move || source.fetch_summaries())
            .await
            .unwrap_or_else(|e| Err(SourceError::Query(format!("summaries task failed: {}", e))))
    }

    /// Diffs `current` against the Summary Cache, merges it back and enriches
    /// the resulting buckets.
    ///
    /// Blocking: a History Cache miss may query the Row Source.
    pub fn build_batch(
        &self,
        current: &SummaryMap,
        period_start: DateTime<Utc>,
        period_length_secs: u32,
    ) -> Vec<MetricsBucket> {
        let prev = self.summary_cache.get();
        let mut buckets = make_buckets(current, &prev);
        self.summary_cache.refresh(current);
        debug!(stats = %self.summary_cache.stats(), "summary cache");

        for bucket in &mut buckets {
            self.enrich(bucket, period_start, period_length_secs);
        }
        if !buckets.is_empty() {
            debug!(stats = %self.history_cache.stats(), "history cache");
        }
        buckets
    }

    fn enrich(&self, bucket: &mut MetricsBucket, period_start: DateTime<Utc>, length: u32) {
        let max_len = self.config.max_query_length;

        bucket.agent_id = self.config.agent_id.clone();
        bucket.period_start_unix_secs = period_start.timestamp();
        bucket.period_length_secs = length;

        let (fingerprint, cut) = truncate_query(&bucket.fingerprint, max_len);
        bucket.fingerprint = fingerprint;
        bucket.is_truncated = cut;

        let Some(event) = self.history_cache.get(&bucket.queryid) else {
            return;
        };
        if bucket.schema.is_empty()
            && let Some(schema) = event.current_schema
        {
            bucket.schema = schema;
        }
        let Some(text) = event.sql_text.filter(|t| !t.is_empty()) else {
            return;
        };
        // Tags come from the full text, even when examples are not attached.
        if !self.config.disable_comments_parsing {
            bucket.comments = parse_comments(&text);
        }
        if self.config.disable_query_examples {
            return;
        }
        let (text, cut) = truncate_query(&text, max_len);
        bucket.is_truncated |= cut;
        bucket.example = Some(QueryExample {
            text,
            format: ExampleFormat::Example,
            kind: ExampleType::Random,
        });
    }
}

/// Sends `change` unless cancellation comes first.
///
/// Returns `false` when the loop should stop: cancelled or receiver dropped.
async fn emit(tx: &mpsc::Sender<Change>, cancel: &CancellationToken, change: Change) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        res = tx.send(change) => {
            if res.is_err() {
                debug!("change receiver dropped");
            }
            res.is_ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DigestSummary, HistoryEvent, HistoryMap, Metric};
    use crate::source::MockSource;
    use chrono::TimeZone;

    // Loop tests run on a paused clock, so this never costs real time.
    const RECV_TIMEOUT: Duration = Duration::from_secs(600);

    /// Wall clock that follows tokio's (possibly paused) time from `base`.
    struct PausedClock {
        base: DateTime<Utc>,
        origin: tokio::time::Instant,
    }

    impl PausedClock {
        fn starting_at(base: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self {
                base,
                origin: tokio::time::Instant::now(),
            })
        }
    }

    impl Clock for PausedClock {
        fn now(&self) -> DateTime<Utc> {
            self.base + chrono::Duration::from_std(self.origin.elapsed()).unwrap()
        }
    }

    fn summary(digest: &str, count_star: u64, schema: Option<&str>) -> DigestSummary {
        DigestSummary {
            digest: digest.to_string(),
            digest_text: format!("SELECT * FROM `t_{}` WHERE `id` = ?", digest),
            schema_name: schema.map(str::to_string),
            count_star,
            sum_rows_sent: count_star * 2,
            ..Default::default()
        }
    }

    fn summaries(items: Vec<DigestSummary>) -> SummaryMap {
        items.into_iter().map(|s| (s.digest.clone(), s)).collect()
    }

    fn history(digest: &str, text: &str, schema: &str) -> HistoryMap {
        let mut m = HistoryMap::new();
        m.insert(
            digest.to_string(),
            HistoryEvent {
                digest: digest.to_string(),
                sql_text: Some(text.to_string()),
                current_schema: Some(schema.to_string()),
            },
        );
        m
    }

    fn period_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn sorted(mut batch: Vec<MetricsBucket>) -> Vec<MetricsBucket> {
        batch.sort_by(|a, b| a.queryid.cmp(&b.queryid));
        batch
    }

    #[test]
    fn build_batch_stamps_and_enriches() {
        let source = Arc::new(MockSource::new());
        source.set_history(history("A", "SELECT * FROM t_A WHERE id = 7", "world"));
        let collector = Collector::new(source.clone(), CollectorConfig::new("agent-1"));
        collector
            .summary_cache()
            .refresh(&summaries(vec![summary("A", 10, None)]));

        let batch = collector.build_batch(
            &summaries(vec![summary("A", 15, None), summary("B", 3, Some("shop"))]),
            period_start(),
            60,
        );
        let batch = sorted(batch);
        assert_eq!(batch.len(), 2);

        let a = &batch[0];
        assert_eq!(a.agent_id, "agent-1");
        assert_eq!(a.period_start_unix_secs, period_start().timestamp());
        assert_eq!(a.period_length_secs, 60);
        assert_eq!(a.num_queries, 5.0);
        assert_eq!(a.metric(Metric::RowsSent).map(|m| m.sum), Some(10.0));
        assert_eq!(a.schema, "world");
        let example = a.example.as_ref().unwrap();
        assert_eq!(example.text, "SELECT * FROM t_A WHERE id = 7");
        assert_eq!(example.format, ExampleFormat::Example);
        assert_eq!(example.kind, ExampleType::Random);
        assert!(!a.is_truncated);

        let b = &batch[1];
        assert_eq!(b.schema, "shop");
        assert!(b.example.is_none());
    }

    #[test]
    fn build_batch_merges_current_into_cache() {
        let source = Arc::new(MockSource::new());
        let collector = Collector::new(source, CollectorConfig::new("agent-1"));
        let current = summaries(vec![summary("A", 4, None)]);

        assert_eq!(collector.build_batch(&current, period_start(), 60).len(), 1);
        assert_eq!(collector.summary_cache().get()["A"].count_star, 4);
        assert!(collector.build_batch(&current, period_start(), 60).is_empty());
    }

    #[test]
    fn disabled_examples_still_backfill_schema() {
        let source = Arc::new(MockSource::new());
        source.set_history(history("A", "SELECT 1", "world"));
        let config = CollectorConfig::new("agent-1").with_query_examples_disabled(true);
        let collector = Collector::new(source, config);

        let current = summaries(vec![summary("A", 1, None)]);
        let batch = collector.build_batch(&current, period_start(), 60);
        assert_eq!(batch[0].schema, "world");
        assert!(batch[0].example.is_none());
    }

    #[test]
    fn long_texts_are_truncated() {
        let source = Arc::new(MockSource::new());
        source.set_history(history("A", "SELECT 'a very long literal value'", "world"));
        let config = CollectorConfig::new("agent-1").with_max_query_length(16);
        let collector = Collector::new(source, config);

        let current = summaries(vec![summary("A", 1, None)]);
        let batch = collector.build_batch(&current, period_start(), 60);
        let b = &batch[0];
        assert!(b.is_truncated);
        assert_eq!(b.fingerprint.chars().count(), 16);
        assert!(b.fingerprint.ends_with("..."));
        assert_eq!(b.example.as_ref().unwrap().text, "SELECT 'a ver...");
    }

    #[test]
    fn comment_tags_are_parsed_from_full_example() {
        let source = Arc::new(MockSource::new());
        source.set_history(history(
            "A",
            "SELECT /* Sleep controller='test' */ sleep(0.1)",
            "world",
        ));
        let config = CollectorConfig::new("agent-1")
            .with_max_query_length(12)
            .with_query_examples_disabled(true);
        let collector = Collector::new(source, config);

        let current = summaries(vec![summary("A", 1, None)]);
        let batch = collector.build_batch(&current, period_start(), 60);
        assert!(batch[0].example.is_none());
        assert_eq!(batch[0].comments.len(), 1);
        assert_eq!(batch[0].comments["controller"], "test");
    }

    #[test]
    fn comment_parsing_can_be_disabled() {
        let source = Arc::new(MockSource::new());
        source.set_history(history("A", "SELECT 1 /* job='nightly' */", "world"));
        let config = CollectorConfig::new("agent-1").with_comments_parsing_disabled(true);
        let collector = Collector::new(source, config);

        let current = summaries(vec![summary("A", 1, None)]);
        let batch = collector.build_batch(&current, period_start(), 60);
        assert!(batch[0].comments.is_empty());
        assert_eq!(
            batch[0].example.as_ref().unwrap().text,
            "SELECT 1 /* job='nightly' */"
        );
    }

    // ------------------------------------------------------------
    // Loop lifecycle
    // ------------------------------------------------------------

    fn paused_collector(source: Arc<MockSource>, config: CollectorConfig) -> Collector {
        let base = period_start() + chrono::Duration::milliseconds(10);
        Collector::new(source, config).with_clock(PausedClock::starting_at(base))
    }

    fn fast_config() -> CollectorConfig {
        CollectorConfig::new("agent-1")
            .with_query_interval(Duration::from_millis(50))
            .with_history_intervals(Duration::from_millis(20), Duration::from_millis(50))
    }

    async fn next(rx: &mut mpsc::Receiver<Change>) -> Change {
        tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for a change")
            .expect("channel closed early")
    }

    async fn next_status(rx: &mut mpsc::Receiver<Change>) -> AgentStatus {
        next(rx).await.status().expect("expected a status change")
    }

    async fn drain(mut rx: mpsc::Receiver<Change>) -> Vec<Change> {
        let mut out = Vec::new();
        while let Some(change) = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out draining")
        {
            out.push(change);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn emits_running_then_batches_then_done() {
        let source = Arc::new(MockSource::typical_workload());
        let cancel = CancellationToken::new();
        let (mut rx, handle) = paused_collector(source, fast_config()).start(cancel.clone());

        assert_eq!(next_status(&mut rx).await, AgentStatus::Starting);
        assert_eq!(next_status(&mut rx).await, AgentStatus::Running);

        let Change::MetricsEmitted(batch) = next(&mut rx).await else {
            panic!("expected a batch");
        };
        let batch = sorted(batch);
        assert_eq!(batch.len(), 3);
        for b in &batch {
            // Seeded by the initial fetch, so only one workload step is reported.
            assert_eq!(b.num_queries, 10.0);
            assert_eq!(b.agent_id, "agent-1");
            assert!(b.example.is_some());
        }
        assert_eq!(batch[0].queryid, "3f2a9c1e");

        cancel.cancel();
        let rest = drain(rx).await;
        let statuses: Vec<AgentStatus> = rest.iter().filter_map(Change::status).collect();
        assert_eq!(statuses, vec![AgentStatus::Stopping, AgentStatus::Done]);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_reported_as_waiting_and_recovered() {
        let source = Arc::new(MockSource::typical_workload());
        source.fail_summaries_once(SourceError::Connection("refused".to_string()));
        source.fail_summaries_once(SourceError::Query("timeout".to_string()));
        let cancel = CancellationToken::new();
        let (mut rx, handle) =
            paused_collector(source.clone(), fast_config()).start(cancel.clone());

        let mut statuses = Vec::new();
        for _ in 0..6 {
            statuses.push(next_status(&mut rx).await);
        }
        assert_eq!(
            statuses,
            vec![
                AgentStatus::Starting,
                AgentStatus::Waiting,
                AgentStatus::Starting,
                AgentStatus::Waiting,
                AgentStatus::Starting,
                AgentStatus::Running,
            ]
        );

        let Change::MetricsEmitted(batch) = next(&mut rx).await else {
            panic!("expected a batch");
        };
        // No baseline was ever seeded, so every digest is new.
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|b| b.num_queries == 10.0));

        cancel.cancel();
        drain(rx).await;
        handle.await.unwrap();
        assert!(source.summary_calls() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_first_tick_closes_stream() {
        let source = Arc::new(MockSource::new());
        let config = CollectorConfig::new("agent-1").with_query_interval(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let (mut rx, handle) = paused_collector(source, config).start(cancel.clone());

        assert_eq!(next_status(&mut rx).await, AgentStatus::Starting);
        assert_eq!(next_status(&mut rx).await, AgentStatus::Running);
        cancel.cancel();

        assert_eq!(next_status(&mut rx).await, AgentStatus::Stopping);
        assert_eq!(next_status(&mut rx).await, AgentStatus::Done);
        assert!(rx.recv().await.is_none());
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_periods_emit_empty_batches() {
        let source = Arc::new(MockSource::new());
        source.set_summaries(summaries(vec![summary("A", 5, None)]));
        let cancel = CancellationToken::new();
        let (mut rx, handle) = paused_collector(source, fast_config()).start(cancel.clone());

        assert_eq!(next_status(&mut rx).await, AgentStatus::Starting);
        assert_eq!(next_status(&mut rx).await, AgentStatus::Running);
        assert_eq!(next(&mut rx).await, Change::MetricsEmitted(Vec::new()));

        cancel.cancel();
        drain(rx).await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_stamped_with_contiguous_periods() {
        let source = Arc::new(MockSource::typical_workload());
        let config = CollectorConfig::new("agent-1")
            .with_query_interval(Duration::from_secs(60))
            .with_history_intervals(Duration::from_secs(5), Duration::from_secs(10));
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 15).unwrap();
        let collector = Collector::new(source, config).with_clock(PausedClock::starting_at(base));
        let cancel = CancellationToken::new();
        let (mut rx, handle) = collector.start(cancel.clone());

        assert_eq!(next_status(&mut rx).await, AgentStatus::Starting);
        assert_eq!(next_status(&mut rx).await, AgentStatus::Running);

        let mut stamps = Vec::new();
        for _ in 0..3 {
            let Change::MetricsEmitted(batch) = next(&mut rx).await else {
                panic!("expected a batch");
            };
            assert!(!batch.is_empty());
            let first = (batch[0].period_start_unix_secs, batch[0].period_length_secs);
            assert!(
                batch
                    .iter()
                    .all(|b| (b.period_start_unix_secs, b.period_length_secs) == first)
            );
            stamps.push(first);
        }

        let minute = |m: u32| Utc.with_ymd_and_hms(2024, 5, 1, 12, m, 0).unwrap().timestamp();
        // The first period runs from start-up to the first boundary.
        assert_eq!(stamps[0], (base.timestamp(), 45));
        assert_eq!(stamps[1], (minute(1), 60));
        assert_eq!(stamps[2], (minute(2), 60));
        for pair in stamps.windows(2) {
            assert_eq!(pair[0].0 + pair[0].1 as i64, pair[1].0);
        }

        cancel.cancel();
        drain(rx).await;
        handle.await.unwrap();
    }
}
