//! Error types for Row Source access.

/// Error returned by a [`RowSource`](crate::source::RowSource) call.
///
/// Everything except `EnvNotSet` (raised only while building a source) is
/// transient for the collector: logged, reported as `Waiting`, retried next tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Required environment variable not set.
    EnvNotSet(String),
    /// Connection could not be established or was lost.
    Connection(String),
    /// Query execution failed.
    Query(String),
    /// The statistics view is not available (extension missing, feature disabled).
    Unavailable(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::EnvNotSet(var) => write!(f, "{} not set", var),
            SourceError::Connection(msg) => write!(f, "connection error: {}", msg),
            SourceError::Query(msg) => write!(f, "query error: {}", msg),
            SourceError::Unavailable(what) => write!(f, "{} is not available", what),
        }
    }
}

impl std::error::Error for SourceError {}
