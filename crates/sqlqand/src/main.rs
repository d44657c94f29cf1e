//! sqlqand - query analytics collector daemon.
//!
//! Polls per-digest statement statistics from PostgreSQL, turns them into
//! per-period buckets and writes every batch to stdout as one JSON line.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

use sqlqan_core::config::{
    DEFAULT_CACHE_SIZE, DEFAULT_HISTORY_CLEANUP_INTERVAL, DEFAULT_HISTORY_REFRESH_INTERVAL,
    DEFAULT_HISTORY_RETAIN, DEFAULT_MAX_QUERY_LENGTH, DEFAULT_SUMMARY_RETAIN,
};
use sqlqan_core::{
    AgentStatus, Change, Collector, CollectorConfig, MetricsBucket, MockSource, PostgresSource,
    RowSource,
};

/// Query analytics collector daemon.
#[derive(Parser, Debug)]
#[command(name = "sqlqand", about = "Query analytics collector daemon", version)]
struct Args {
    /// Collection interval in seconds. Periods are aligned to multiples of it.
    #[arg(short, long, default_value = "60", env = "SQLQAN_INTERVAL")]
    interval: u64,

    /// Agent identifier stamped onto every bucket.
    #[arg(long, default_value = "sqlqand", env = "SQLQAN_AGENT_ID")]
    agent_id: String,

    /// Maximum length of fingerprints and examples (0 disables truncation).
    #[arg(long, default_value_t = DEFAULT_MAX_QUERY_LENGTH, env = "SQLQAN_MAX_QUERY_LENGTH")]
    max_query_length: usize,

    /// Do not attach example statements to buckets.
    #[arg(long, env = "SQLQAN_DISABLE_QUERY_EXAMPLES")]
    disable_query_examples: bool,

    /// Do not extract key='value' tags from comments of example statements.
    #[arg(long, env = "SQLQAN_DISABLE_COMMENTS_PARSING")]
    disable_comments_parsing: bool,

    /// Summary cache retention in seconds.
    #[arg(long, default_value_t = DEFAULT_SUMMARY_RETAIN.as_secs())]
    summary_retain: u64,

    /// History cache retention in seconds.
    #[arg(long, default_value_t = DEFAULT_HISTORY_RETAIN.as_secs())]
    history_retain: u64,

    /// History refresh interval in seconds.
    #[arg(long, default_value_t = DEFAULT_HISTORY_REFRESH_INTERVAL.as_secs())]
    history_refresh: u64,

    /// History cleanup interval in seconds.
    #[arg(long, default_value_t = DEFAULT_HISTORY_CLEANUP_INTERVAL.as_secs())]
    history_cleanup: u64,

    /// Row limit of each cache (0 means unlimited).
    #[arg(long, default_value_t = DEFAULT_CACHE_SIZE)]
    cache_size: usize,

    /// Use a built-in synthetic workload instead of PostgreSQL.
    #[arg(long)]
    mock: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn collector_config(&self) -> CollectorConfig {
        CollectorConfig::new(self.agent_id.clone())
            .with_query_interval(Duration::from_secs(self.interval))
            .with_summary_retain(Duration::from_secs(self.summary_retain))
            .with_history_retain(Duration::from_secs(self.history_retain))
            .with_history_intervals(
                Duration::from_secs(self.history_refresh),
                Duration::from_secs(self.history_cleanup),
            )
            .with_cache_sizes(self.cache_size, self.cache_size)
            .with_max_query_length(self.max_query_length)
            .with_query_examples_disabled(self.disable_query_examples)
            .with_comments_parsing_disabled(self.disable_comments_parsing)
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = log_level(verbose, quiet);

    let mut filter = EnvFilter::from_default_env();
    for target in ["sqlqand", "sqlqan_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn log_level(verbose: u8, quiet: bool) -> Level {
    if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

/// Writes one batch as a single JSON line.
fn write_batch<W: Write>(out: &mut W, batch: &[MetricsBucket]) -> io::Result<()> {
    serde_json::to_writer(&mut *out, batch)?;
    out.write_all(b"\n")?;
    out.flush()
}

/// Builds the PostgreSQL source from PG* variables, or `None` if impossible.
fn postgres_source() -> Option<PostgresSource> {
    let pg_host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
    let pg_port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());

    match PostgresSource::from_env() {
        Ok(source) => {
            match source.try_connect() {
                Ok(()) => info!("PostgreSQL source: connected to {}:{}", pg_host, pg_port),
                Err(e) => warn!("PostgreSQL source: connection failed ({})", e),
            }
            Some(source)
        }
        Err(e) => {
            error!("PostgreSQL source: {}", e);
            None
        }
    }
}

/// Drains the change stream until the collector closes it.
async fn forward(collector: Collector, cancel: CancellationToken) {
    let (mut rx, handle) = collector.start(cancel);
    let mut batches: u64 = 0;

    while let Some(change) = rx.recv().await {
        match change {
            Change::StatusChanged(status) => match status {
                AgentStatus::Waiting => warn!(status = %status, "collector status changed"),
                _ => info!(status = %status, "collector status changed"),
            },
            Change::MetricsEmitted(batch) => {
                batches += 1;
                if let Err(e) = write_batch(&mut io::stdout().lock(), &batch) {
                    error!(error = %e, "failed to write batch");
                }
            }
        }
    }

    if let Err(e) = handle.await {
        error!(error = %e, "collector task failed");
    }
    info!(batches, "collector finished");
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let config = args.collector_config();
    info!("sqlqand {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: interval={}s, agent_id={}, max_query_length={}, examples={}, comments={}",
        config.query_interval.as_secs(),
        config.agent_id,
        config.max_query_length,
        !config.disable_query_examples,
        !config.disable_comments_parsing
    );

    let source: Arc<dyn RowSource> = if args.mock {
        info!("Using synthetic workload");
        Arc::new(MockSource::typical_workload())
    } else {
        match postgres_source() {
            Some(source) => Arc::new(source),
            None => std::process::exit(1),
        }
    };

    let cancel = CancellationToken::new();
    let c = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        c.cancel();
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to build tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(forward(Collector::new(source, config), cancel));
    info!("Shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlqan_core::model::{Metric, MetricStat};

    #[test]
    fn defaults_match_collector_defaults() {
        let args = Args::try_parse_from(["sqlqand"]).unwrap();
        let cfg = args.collector_config();
        let defaults = CollectorConfig::default();

        assert_eq!(cfg.query_interval, defaults.query_interval);
        assert_eq!(cfg.summary_retain, defaults.summary_retain);
        assert_eq!(cfg.history_retain, defaults.history_retain);
        assert_eq!(cfg.history_refresh_interval, defaults.history_refresh_interval);
        assert_eq!(cfg.max_query_length, defaults.max_query_length);
        assert!(!cfg.disable_query_examples);
        assert!(!cfg.disable_comments_parsing);
        assert!(!args.mock);
    }

    #[test]
    fn flags_are_applied() {
        let args = Args::try_parse_from([
            "sqlqand",
            "--interval",
            "10",
            "--agent-id",
            "db-1",
            "--max-query-length",
            "0",
            "--disable-query-examples",
            "--disable-comments-parsing",
            "--cache-size",
            "100",
            "--mock",
        ])
        .unwrap();
        let cfg = args.collector_config();

        assert_eq!(cfg.query_interval, Duration::from_secs(10));
        assert_eq!(cfg.agent_id, "db-1");
        assert_eq!(cfg.max_query_length, 0);
        assert!(cfg.disable_query_examples);
        assert!(cfg.disable_comments_parsing);
        assert_eq!(cfg.summary_cache_size, 100);
        assert_eq!(cfg.history_cache_size, 100);
        assert!(args.mock);
    }

    #[test]
    fn verbosity_levels() {
        assert_eq!(log_level(0, false), Level::INFO);
        assert_eq!(log_level(1, false), Level::DEBUG);
        assert_eq!(log_level(2, false), Level::TRACE);
        assert_eq!(log_level(2, true), Level::ERROR);
    }

    #[test]
    fn batch_is_one_json_line() {
        let mut bucket = MetricsBucket {
            queryid: "3f2a9c1e".to_string(),
            fingerprint: "SELECT ?".to_string(),
            num_queries: 5.0,
            ..Default::default()
        };
        bucket
            .metrics
            .insert(Metric::RowsSent, MetricStat { sum: 10.0, cnt: 5.0 });

        let mut out = Vec::new();
        write_batch(&mut out, &[bucket]).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.ends_with('\n'));
        assert_eq!(text.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value[0]["queryid"], "3f2a9c1e");
        assert_eq!(value[0]["metrics"]["rows_sent"]["sum"], 10.0);
        assert!(value[0].get("example").is_none());
        assert!(value[0].get("comments").is_none());
    }
}
