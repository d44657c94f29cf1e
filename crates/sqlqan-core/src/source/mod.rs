//! Row Source: the database-access collaborator that reads the statistics tables.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │          RowSource           │ (trait)
//! │  fetch_summaries()           │
//! │  fetch_history()             │
//! └──────────────┬───────────────┘
//!        ┌───────┴────────┐
//!  ┌─────▼──────┐  ┌──────▼──────┐
//!  │ Postgres   │  │ MockSource  │
//!  │ Source     │  │ (testing)   │
//!  └────────────┘  └─────────────┘
//! ```
//!
//! Both calls are synchronous and may block on network I/O; the collector runs
//! them on blocking threads. Timeouts are the implementation's responsibility.

pub mod mock;
mod postgres;

pub use self::mock::MockSource;
pub use self::postgres::PostgresSource;

use crate::error::SourceError;
use crate::model::{HistoryMap, SummaryMap};

/// Supplier of full statistics snapshots.
pub trait RowSource: Send + Sync {
    /// Reads cumulative counters for every digest currently in the summary table.
    fn fetch_summaries(&self) -> Result<SummaryMap, SourceError>;

    /// Reads the most recent example statement per digest.
    fn fetch_history(&self) -> Result<HistoryMap, SourceError>;
}
