//! sqlqan-core - query analytics collector library.
//!
//! Provides:
//! - `source`: Row Source trait with PostgreSQL and scripted mock implementations
//! - `summary_cache` / `history_cache`: time-bounded caches of cumulative
//!   counters and example statements
//! - `buckets`: delta engine turning two snapshots into per-period buckets
//! - `comments`: `key='value'` tags from SQL comments
//! - `collector`: wall-clock aligned collection loop and its change stream
//! - `refresher`: background loops keeping the history cache warm
//! - `model`, `status`, `config`, `error`: shared types

pub mod buckets;
pub mod cache;
pub mod collector;
pub mod comments;
pub mod config;
pub mod error;
pub mod history_cache;
pub mod model;
pub mod refresher;
pub mod schedule;
pub mod source;
pub mod status;
pub mod summary_cache;
pub mod truncate;

pub use cache::{CacheStats, LookupStats};
pub use collector::Collector;
pub use config::CollectorConfig;
pub use schedule::{Clock, SystemClock};
pub use error::SourceError;
pub use model::{DigestSummary, HistoryEvent, Metric, MetricStat, MetricsBucket};
pub use source::{MockSource, PostgresSource, RowSource};
pub use status::{AgentStatus, Change};
