//! The task record: identity, payload, scheduling fields, and attempt
//! accounting. See `options.rs` for the publish-time configuration
//! surface that produces a `Task`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One unit of work moving through a queue's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub payload: Vec<u8>,
    pub status: TaskStatus,

    pub published_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,

    /// Elapsed wall time of the last handler invocation, in seconds.
    pub exec_time: f64,

    /// If set and in the future, the task is held in the delayed set.
    pub eta: Option<DateTime<Utc>>,

    /// Count of additional retries after the first failure (0 = no retries).
    pub max_retries: u32,
    /// Attempts made so far, across the whole lifetime of this task id.
    pub retried: u32,

    pub retry_intervals: Vec<Duration>,
    pub timeout: Duration,
    pub ttl: Duration,

    pub error: Option<String>,
    pub result: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl Task {
    /// Remaining retry attempts after the current one, given `retried`
    /// attempts have already happened.
    pub fn retries_remaining(&self) -> bool {
        self.retried <= self.max_retries
    }

    /// Backoff Δ for attempt index `k` (0 = first retry, after the
    /// initial failure): `retry_intervals[min(k, len-1)]`.
    pub fn retry_delay(&self, attempt_index: u32) -> Duration {
        if self.retry_intervals.is_empty() {
            return Duration::from_secs(0);
        }
        let idx = (attempt_index as usize).min(self.retry_intervals.len() - 1);
        self.retry_intervals[idx]
    }

    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        matches!(self.eta, Some(eta) if eta > now)
    }
}

pub(crate) fn default_retry_intervals() -> Vec<Duration> {
    vec![
        Duration::from_secs(60),
        Duration::from_secs(120),
        Duration::from_secs(180),
    ]
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_TTL: Duration = Duration::from_secs(180);
