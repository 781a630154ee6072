//! Publish-time options and the per-queue/per-engine defaults they
//! layer over. Resolution order: task option > queue option > engine
//! option > built-in default.

use crate::error::{Error, Result};
use crate::task::{default_retry_intervals, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT, DEFAULT_TTL};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Options recognized by `Queue::publish`. Exactly one of `eta`/`countdown`
/// may be set.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub id: Option<String>,
    pub eta: Option<DateTime<Utc>>,
    pub countdown: Option<Duration>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_intervals: Option<Vec<Duration>>,
    pub ttl: Option<Duration>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.retry_intervals = Some(intervals);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Resolve the absolute `eta` this publish should use, validating
    /// that `eta` and `countdown` were not both set.
    pub fn resolve_eta(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match (&self.eta, &self.countdown) {
            (Some(_), Some(_)) => Err(Error::Configuration(
                "eta and countdown are mutually exclusive".into(),
            )),
            (Some(eta), None) => Ok(Some(*eta)),
            (None, Some(countdown)) => Ok(Some(now + chrono::Duration::from_std(*countdown)
                .map_err(|e| Error::Configuration(e.to_string()))?)),
            (None, None) => Ok(None),
        }
    }
}

/// Default task options for a queue: concurrency plus the same
/// retry/timeout/ttl knobs `PublishOptions` can override per-task.
#[derive(Debug, Clone)]
pub struct TaskDefaults {
    pub max_retries: u32,
    pub retry_intervals: Vec<Duration>,
    pub timeout: Duration,
    pub ttl: Duration,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_intervals: default_retry_intervals(),
            timeout: DEFAULT_TIMEOUT,
            ttl: DEFAULT_TTL,
        }
    }
}

impl TaskDefaults {
    /// Resolve a single publish's options against this queue's
    /// defaults: task option wins, else the queue default.
    pub fn resolve(&self, task: &PublishOptions) -> ResolvedOptions {
        ResolvedOptions {
            max_retries: task.max_retries.unwrap_or(self.max_retries),
            retry_intervals: task
                .retry_intervals
                .clone()
                .unwrap_or_else(|| self.retry_intervals.clone()),
            timeout: task.timeout.unwrap_or(self.timeout),
            ttl: task.ttl.unwrap_or(self.ttl),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub max_retries: u32,
    pub retry_intervals: Vec<Duration>,
    pub timeout: Duration,
    pub ttl: Duration,
}

/// Per-queue overrides of the engine-level `TaskDefaults`, applied
/// once when a queue is created via `Engine::queue_with_options`.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub max_retries: Option<u32>,
    pub retry_intervals: Option<Vec<Duration>>,
    pub timeout: Option<Duration>,
    pub ttl: Option<Duration>,
}

impl QueueOptions {
    /// Apply these overrides on top of the engine's `TaskDefaults`.
    pub fn resolve(&self, engine_defaults: &TaskDefaults) -> TaskDefaults {
        TaskDefaults {
            max_retries: self.max_retries.unwrap_or(engine_defaults.max_retries),
            retry_intervals: self
                .retry_intervals
                .clone()
                .unwrap_or_else(|| engine_defaults.retry_intervals.clone()),
            timeout: self.timeout.unwrap_or(engine_defaults.timeout),
            ttl: self.ttl.unwrap_or(engine_defaults.ttl),
        }
    }
}

/// Options recognized by `Queue::subscribe`.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub concurrency: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_eta_and_countdown_is_an_error() {
        let opts = PublishOptions::new()
            .with_eta(Utc::now())
            .with_countdown(Duration::from_secs(1));
        assert!(matches!(
            opts.resolve_eta(Utc::now()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn countdown_adds_to_now() {
        let now = Utc::now();
        let opts = PublishOptions::new().with_countdown(Duration::from_secs(100));
        let eta = opts.resolve_eta(now).unwrap().unwrap();
        assert_eq!(eta, now + chrono::Duration::seconds(100));
    }

    #[test]
    fn queue_options_override_engine_defaults() {
        let engine_defaults = TaskDefaults::default();
        let queue_options = QueueOptions {
            max_retries: Some(9),
            ..QueueOptions::default()
        };

        let queue_defaults = queue_options.resolve(&engine_defaults);
        assert_eq!(queue_defaults.max_retries, 9);
        assert_eq!(queue_defaults.timeout, engine_defaults.timeout);
    }

    #[test]
    fn task_options_override_queue_defaults() {
        let queue_defaults = TaskDefaults {
            max_retries: 9,
            ..TaskDefaults::default()
        };
        let task_opts = PublishOptions::new().with_max_retries(1);

        let resolved = queue_defaults.resolve(&task_opts);
        assert_eq!(resolved.max_retries, 1);

        let resolved_no_override = queue_defaults.resolve(&PublishOptions::new());
        assert_eq!(resolved_no_override.max_retries, 9);
    }
}
