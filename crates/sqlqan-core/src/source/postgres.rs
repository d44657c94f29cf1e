//! PostgreSQL Row Source.
//!
//! Reads digest summaries from `pg_stat_statements` and example statements from
//! `pg_stat_activity` (PG 14+, requires `compute_query_id`). Counters map onto
//! the summary layout as follows:
//! - `queryid` → digest, `query` → fingerprint, database name → schema
//! - `calls` → execution count
//! - `total_exec_time` (milliseconds) → query time (picoseconds)
//! - `rows` → rows sent
//!
//! Counters PostgreSQL does not expose stay zero and never appear in buckets.

use std::sync::{Mutex, PoisonError};

use postgres::{Client, NoTls, Row};
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::model::{DigestSummary, HistoryEvent, HistoryMap, SummaryMap};

use super::RowSource;

const PICOSECONDS_PER_MILLISECOND: f64 = 1e9;

struct Connection {
    client: Client,
    server_version_num: Option<i32>,
    statements_ext_version: Option<String>,
}

/// Row Source reading PostgreSQL statistics views.
///
/// Connects lazily using a libpq-style connection string. Any query error drops
/// the connection; the next call reconnects.
pub struct PostgresSource {
    connection_string: String,
    conn: Mutex<Option<Connection>>,
}

impl PostgresSource {
    /// Creates a source from environment variables.
    ///
    /// - PGHOST (default: localhost)
    /// - PGPORT (default: 5432)
    /// - PGUSER (default: $USER)
    /// - PGPASSWORD (default: empty)
    /// - PGDATABASE (default: same as PGUSER)
    pub fn from_env() -> Result<Self, SourceError> {
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| SourceError::EnvNotSet("PGUSER or USER".to_string()))?;

        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let password = std::env::var("PGPASSWORD").unwrap_or_default();
        let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

        let connection_string = if password.is_empty() {
            format!(
                "host={} port={} user={} dbname={}",
                host, port, user, database
            )
        } else {
            format!(
                "host={} port={} user={} password={} dbname={}",
                host, port, user, password, database
            )
        };

        Ok(Self::with_connection_string(connection_string))
    }

    pub fn with_connection_string(connection_string: String) -> Self {
        Self {
            connection_string,
            conn: Mutex::new(None),
        }
    }

    /// Attempts to connect. Useful as a startup check.
    pub fn try_connect(&self) -> Result<(), SourceError> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_connected(&mut guard).map(|_| ())
    }

    fn ensure_connected<'a>(
        &self,
        slot: &'a mut Option<Connection>,
    ) -> Result<&'a mut Connection, SourceError> {
        if slot.is_none() {
            let mut client = Client::connect(&self.connection_string, NoTls)
                .map_err(|e| SourceError::Connection(format_postgres_error(&e)))?;

            let server_version_num = client
                .query_one("SHOW server_version_num", &[])
                .ok()
                .and_then(|row| row.try_get::<_, String>(0).ok())
                .and_then(|v| v.parse::<i32>().ok());

            let statements_ext_version = client
                .query_opt(
                    "SELECT extversion FROM pg_extension WHERE extname = 'pg_stat_statements'",
                    &[],
                )
                .map_err(|e| SourceError::Query(format_postgres_error(&e)))?
                .and_then(|row| row.try_get::<_, String>(0).ok());

            info!(
                server_version_num = server_version_num.unwrap_or(0),
                pg_stat_statements = statements_ext_version.as_deref().unwrap_or("missing"),
                "connected to PostgreSQL"
            );

            *slot = Some(Connection {
                client,
                server_version_num,
                statements_ext_version,
            });
        }

        slot.as_mut()
            .ok_or_else(|| SourceError::Connection("not connected".to_string()))
    }

    /// Runs `f` on a live connection, dropping the connection if it fails.
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, SourceError>,
    ) -> Result<T, SourceError> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = self.ensure_connected(&mut guard)?;
        let result = f(conn);
        if let Err(SourceError::Query(_) | SourceError::Connection(_)) = &result {
            *guard = None;
        }
        result
    }
}

impl RowSource for PostgresSource {
    fn fetch_summaries(&self) -> Result<SummaryMap, SourceError> {
        self.with_connection(|conn| {
            if conn.statements_ext_version.is_none() {
                return Err(SourceError::Unavailable("pg_stat_statements".to_string()));
            }
            let query = build_summaries_query(conn.server_version_num);
            let rows = conn
                .client
                .query(&query, &[])
                .map_err(|e| SourceError::Query(format_postgres_error(&e)))?;

            let mut out = SummaryMap::with_capacity(rows.len());
            for row in &rows {
                let summary = summary_from_row(row)?;
                out.insert(summary.digest.clone(), summary);
            }
            debug!(rows = out.len(), "read pg_stat_statements");
            Ok(out)
        })
    }

    fn fetch_history(&self) -> Result<HistoryMap, SourceError> {
        self.with_connection(|conn| {
            let Some(query) = build_history_query(conn.server_version_num) else {
                return Ok(HistoryMap::new());
            };
            let rows = conn
                .client
                .query(query, &[])
                .map_err(|e| SourceError::Query(format_postgres_error(&e)))?;

            let mut out = HistoryMap::with_capacity(rows.len());
            for row in &rows {
                let digest: String = column(row, "digest")?;
                let sql_text: String = column(row, "query")?;
                let datname: String = column(row, "datname")?;
                out.insert(
                    digest.clone(),
                    HistoryEvent {
                        digest,
                        sql_text: Some(sql_text),
                        current_schema: (!datname.is_empty()).then_some(datname),
                    },
                );
            }
            Ok(out)
        })
    }
}

fn column<'a, T: postgres::types::FromSql<'a>>(row: &'a Row, name: &str) -> Result<T, SourceError> {
    row.try_get(name)
        .map_err(|e| SourceError::Query(format!("column {}: {}", name, e)))
}

fn summary_from_row(row: &Row) -> Result<DigestSummary, SourceError> {
    let digest: String = column(row, "digest")?;
    let query: String = column(row, "query")?;
    let datname: String = column(row, "datname")?;
    let calls: i64 = column(row, "calls")?;
    let total_exec_time: f64 = column(row, "total_exec_time")?;
    let rows: i64 = column(row, "rows")?;

    if calls < 0 || rows < 0 {
        warn!(digest = %digest, calls, rows, "negative counter in pg_stat_statements");
    }

    Ok(DigestSummary {
        digest,
        digest_text: query,
        schema_name: (!datname.is_empty()).then_some(datname),
        count_star: calls.max(0) as u64,
        sum_timer_wait: (total_exec_time.max(0.0) * PICOSECONDS_PER_MILLISECOND) as u64,
        sum_rows_sent: rows.max(0) as u64,
        ..Default::default()
    })
}

/// Builds version-aware query for pg_stat_statements aggregated per queryid.
fn build_summaries_query(server_version_num: Option<i32>) -> String {
    let total_exec_time_expr = if server_version_num.unwrap_or(0) >= 130000 {
        "s.total_exec_time"
    } else {
        "s.total_time"
    };

    format!(
        r#"
            SELECT
                s.queryid::text as digest,
                MIN(COALESCE(s.query, '')) as query,
                MIN(COALESCE(d.datname, '')) as datname,
                SUM(s.calls)::bigint as calls,
                SUM({total_exec_time_expr})::double precision as total_exec_time,
                SUM(s.rows)::bigint as rows
            FROM pg_stat_statements s
            LEFT JOIN pg_database d ON d.oid = s.dbid
            WHERE s.queryid IS NOT NULL
            GROUP BY s.queryid
        "#
    )
}

/// Returns the history query, or `None` when the server has no `query_id` column.
fn build_history_query(server_version_num: Option<i32>) -> Option<&'static str> {
    if server_version_num.unwrap_or(0) < 140000 {
        return None;
    }
    Some(
        r#"
            SELECT DISTINCT ON (query_id)
                query_id::text as digest,
                query,
                COALESCE(datname, '') as datname
            FROM pg_stat_activity
            WHERE query_id IS NOT NULL
              AND query_id <> 0
              AND COALESCE(query, '') <> ''
              AND pid <> pg_backend_pid()
            ORDER BY query_id, query_start DESC NULLS LAST
        "#,
    )
}

fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else {
            msg
        }
    }
}
