//! Event hooks run before/after each handler invocation, plus the
//! per-execution context they can extend. A hook never shares a
//! mutable map with later stages — it receives the latest `Context`
//! and, for `on_start`, produces a new one that later stages read.

use crate::error::Result;
use crate::task::Task;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Immutable, cheaply-cloned bag of annotations a hook chain threads
/// through a single task execution.
#[derive(Clone, Debug, Default)]
pub struct Context {
    values: Arc<HashMap<String, Value>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Returns a new `Context` with `key` set, leaving `self` untouched.
    pub fn with(&self, key: impl Into<String>, value: Value) -> Self {
        let mut map = (*self.values).clone();
        map.insert(key.into(), value);
        Context {
            values: Arc::new(map),
        }
    }
}

/// The request a handler (and its middleware chain) receives.
#[derive(Clone)]
pub struct Request {
    pub task: Task,
    pub context: Context,
}

impl Request {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            context: Context::new(),
        }
    }
}

/// Snapshot handed to `on_success`/`on_failure`/`on_complete` hooks.
#[derive(Clone)]
pub struct HookEvent {
    pub task: Task,
    pub succeeded: bool,
    pub error: Option<String>,
    /// Set when `error` is a deadline overrun rather than a handler failure.
    pub timed_out: bool,
}

/// Runs before the handler. May replace its request with one carrying
/// an augmented context; returning an error aborts the chain and is
/// treated as a handler failure (no further `on_start` hooks run).
#[async_trait]
pub trait StartHook: Send + Sync {
    async fn on_start(&self, req: Request) -> Result<Request>;
}

/// Runs on success, on (final) failure, or always at completion.
#[async_trait]
pub trait EventHook: Send + Sync {
    async fn on_event(&self, event: HookEvent);
}

pub struct FnStartHook<F>(pub F);

#[async_trait]
impl<F, Fut> StartHook for FnStartHook<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Request>> + Send,
{
    async fn on_start(&self, req: Request) -> Result<Request> {
        (self.0)(req).await
    }
}

pub struct FnEventHook<F>(pub F);

#[async_trait]
impl<F, Fut> EventHook for FnEventHook<F>
where
    F: Fn(HookEvent) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn on_event(&self, event: HookEvent) {
        (self.0)(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use std::time::Duration;

    fn sample_task() -> Task {
        Task {
            id: "1".into(),
            name: "q".into(),
            payload: vec![],
            status: TaskStatus::Waiting,
            published_at: None,
            started_at: None,
            processed_at: None,
            exec_time: 0.0,
            eta: None,
            max_retries: 0,
            retried: 0,
            retry_intervals: vec![],
            timeout: Duration::from_secs(1),
            ttl: Duration::from_secs(1),
            error: None,
            result: None,
        }
    }

    #[test]
    fn context_with_does_not_mutate_original() {
        let base = Context::new();
        let extended = base.with("trace_id", Value::String("abc".into()));

        assert!(base.get("trace_id").is_none());
        assert_eq!(
            extended.get("trace_id"),
            Some(&Value::String("abc".into()))
        );
    }

    #[tokio::test]
    async fn start_hook_can_augment_context() {
        let hook = FnStartHook(|req: Request| async move {
            let context = req.context.with("seen", Value::Bool(true));
            Ok(Request { context, ..req })
        });

        let req = Request::new(sample_task());
        let req = hook.on_start(req).await.unwrap();
        assert_eq!(req.context.get("seen"), Some(&Value::Bool(true)));
    }
}
