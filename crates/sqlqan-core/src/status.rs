//! Collector health states and the values carried on the change channel.

use std::fmt;

use serde::Serialize;

use crate::model::MetricsBucket;

/// Health state reported by the collector loop.
///
/// `Starting → Running ⇄ Waiting → Stopping → Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Starting,
    Running,
    /// Last Row Source query failed; retried on the next tick.
    Waiting,
    Stopping,
    /// Terminal. The channel is closed right after it.
    Done,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Starting => "STARTING",
            AgentStatus::Running => "RUNNING",
            AgentStatus::Waiting => "WAITING",
            AgentStatus::Stopping => "STOPPING",
            AgentStatus::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// One value on the change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    StatusChanged(AgentStatus),
    /// Buckets of one collection period. May be empty.
    MetricsEmitted(Vec<MetricsBucket>),
}

impl Change {
    pub fn status(&self) -> Option<AgentStatus> {
        match self {
            Change::StatusChanged(s) => Some(*s),
            Change::MetricsEmitted(_) => None,
        }
    }
}
