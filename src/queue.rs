//! The per-queue configuration surface: the entry point producers use
//! to publish, and the wiring the consumer reads to dispatch.

use crate::broker::{Broker, Counts};
use crate::error::Result;
use crate::hooks::{EventHook, Request, StartHook};
use crate::middleware::{self, Handler, Middleware, Next};
use crate::options::{PublishOptions, SubscribeOptions, TaskDefaults};
use crate::serializer::{self, Serializer};
use crate::task::{Task, TaskStatus};
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Default)]
struct Runtime {
    handler: Option<Arc<dyn Handler>>,
    middlewares: Vec<Arc<dyn Middleware>>,
    pipeline: Option<Next>,
    concurrency: usize,
    on_start: Vec<Arc<dyn StartHook>>,
    on_complete: Vec<Arc<dyn EventHook>>,
    on_success: Vec<Arc<dyn EventHook>>,
    on_failure: Vec<Arc<dyn EventHook>>,
}

/// A snapshot of everything the consumer needs to dispatch one task,
/// taken without holding the queue's runtime lock across an `.await`.
pub(crate) struct QueueSnapshot {
    pub pipeline: Option<Next>,
    pub concurrency: usize,
    pub on_start: Vec<Arc<dyn StartHook>>,
    pub on_complete: Vec<Arc<dyn EventHook>>,
    pub on_success: Vec<Arc<dyn EventHook>>,
    pub on_failure: Vec<Arc<dyn EventHook>>,
}

pub struct Queue {
    name: String,
    broker: Arc<dyn Broker>,
    serializer: Arc<dyn Serializer>,
    defaults: TaskDefaults,
    runtime: RwLock<Runtime>,
}

impl Queue {
    pub(crate) fn new(
        name: impl Into<String>,
        broker: Arc<dyn Broker>,
        serializer: Arc<dyn Serializer>,
        defaults: TaskDefaults,
    ) -> Self {
        Self {
            name: name.into(),
            broker,
            serializer,
            defaults,
            runtime: RwLock::new(Runtime {
                concurrency: 1,
                ..Runtime::default()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defaults(&self) -> &TaskDefaults {
        &self.defaults
    }

    /// Serialize `value` and publish it, resolving `options` against
    /// this queue's defaults.
    pub async fn publish<T: Serialize>(&self, value: &T, options: PublishOptions) -> Result<Task> {
        let data = serializer::encode(self.serializer.as_ref(), value)?;
        self.publish_bytes(data, options).await
    }

    /// Publish already-serialized bytes. Used directly by producers
    /// that already hold encoded payloads, and internally by the
    /// consumer to re-publish a task on retry.
    pub async fn publish_bytes(&self, data: Vec<u8>, options: PublishOptions) -> Result<Task> {
        let now = Utc::now();
        let eta = options.resolve_eta(now)?;
        let id = options.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let resolved = self.defaults.resolve(&options);

        let task = Task {
            id: id.clone(),
            name: self.name.clone(),
            payload: data,
            status: TaskStatus::Waiting,
            published_at: Some(now),
            started_at: None,
            processed_at: None,
            exec_time: 0.0,
            eta,
            max_retries: resolved.max_retries,
            retried: 0,
            retry_intervals: resolved.retry_intervals,
            timeout: resolved.timeout,
            ttl: resolved.ttl,
            error: None,
            result: None,
        };

        let bytes = serializer::encode(self.serializer.as_ref(), &task)?;
        self.broker
            .publish(&self.name, &id, &bytes, eta)
            .await?;

        Ok(task)
    }

    /// Re-publish an existing task record (carrying forward its
    /// resolved retry/timeout/ttl configuration) for a scheduled retry.
    pub(crate) async fn republish(&self, mut task: Task, eta: chrono::DateTime<Utc>) -> Result<()> {
        task.status = TaskStatus::Waiting;
        task.eta = Some(eta);
        let bytes = serializer::encode(self.serializer.as_ref(), &task)?;
        self.broker
            .publish(&self.name, &task.id, &bytes, Some(eta))
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        match self.broker.get(&self.name, id).await? {
            Some(bytes) => Ok(Some(serializer::decode(self.serializer.as_ref(), &bytes)?)),
            None => Ok(None),
        }
    }

    /// Cancels `id` if it exists and hasn't already reached a terminal
    /// status. An unknown id is a typed absence, not a failure (see
    /// `Error::NotFound`) — logged, not returned, so callers can cancel
    /// an id without first checking whether it still exists.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.broker.cancel(&self.name, id).await?;
        match self.broker.get(&self.name, id).await? {
            Some(bytes) => {
                let mut task: Task = serializer::decode(self.serializer.as_ref(), &bytes)?;
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Canceled;
                    task.processed_at = Some(Utc::now());
                    let bytes = serializer::encode(self.serializer.as_ref(), &task)?;
                    self.broker
                        .set(&self.name, id, &bytes, task.ttl)
                        .await?;
                }
            }
            None => {
                let not_found = crate::error::Error::NotFound {
                    queue: self.name.clone(),
                    id: id.to_string(),
                };
                tracing::debug!(error = %not_found, "cancel: nothing to cancel");
            }
        }
        Ok(())
    }

    pub async fn empty(&self) -> Result<()> {
        self.broker.empty(&self.name).await
    }

    pub async fn count(&self) -> Result<Counts> {
        self.broker.count(&self.name).await
    }

    pub async fn list(&self) -> Result<Vec<Task>> {
        let ids = self.broker.list(&self.name).await?;
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(bytes) = self.broker.get(&self.name, &id).await? {
                tasks.push(serializer::decode(self.serializer.as_ref(), &bytes)?);
            }
        }
        Ok(tasks)
    }

    /// Attach the handler and merge `options` into the queue defaults.
    /// Only the most recent call defines the handler.
    pub fn subscribe<H: Handler + 'static>(&self, handler: H, options: SubscribeOptions) {
        let mut runtime = self.runtime.write().expect("queue runtime lock poisoned");
        runtime.handler = Some(Arc::new(handler));
        runtime.concurrency = options.concurrency.max(1);
        runtime.pipeline = None;
    }

    pub fn use_middleware<M: Middleware + 'static>(&self, middleware: M) {
        let mut runtime = self.runtime.write().expect("queue runtime lock poisoned");
        runtime.middlewares.push(Arc::new(middleware));
        runtime.pipeline = None;
    }

    pub fn on_start<H: StartHook + 'static>(&self, hook: H) {
        self.runtime
            .write()
            .expect("queue runtime lock poisoned")
            .on_start
            .push(Arc::new(hook));
    }

    pub fn on_complete<H: EventHook + 'static>(&self, hook: H) {
        self.runtime
            .write()
            .expect("queue runtime lock poisoned")
            .on_complete
            .push(Arc::new(hook));
    }

    pub fn on_success<H: EventHook + 'static>(&self, hook: H) {
        self.runtime
            .write()
            .expect("queue runtime lock poisoned")
            .on_success
            .push(Arc::new(hook));
    }

    pub fn on_failure<H: EventHook + 'static>(&self, hook: H) {
        self.runtime
            .write()
            .expect("queue runtime lock poisoned")
            .on_failure
            .push(Arc::new(hook));
    }

    pub(crate) fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    pub(crate) fn serializer(&self) -> Arc<dyn Serializer> {
        Arc::clone(&self.serializer)
    }

    /// Snapshot the runtime wiring for the consumer, building (and
    /// caching) the composed middleware pipeline if it isn't current.
    pub(crate) fn snapshot(&self) -> Result<QueueSnapshot> {
        {
            let runtime = self.runtime.read().expect("queue runtime lock poisoned");
            if let Some(pipeline) = &runtime.pipeline {
                return Ok(QueueSnapshot {
                    pipeline: Some(Arc::clone(pipeline)),
                    concurrency: runtime.concurrency,
                    on_start: runtime.on_start.clone(),
                    on_complete: runtime.on_complete.clone(),
                    on_success: runtime.on_success.clone(),
                    on_failure: runtime.on_failure.clone(),
                });
            }
        }

        let mut runtime = self.runtime.write().expect("queue runtime lock poisoned");
        let Some(handler) = runtime.handler.clone() else {
            return Ok(QueueSnapshot {
                pipeline: None,
                concurrency: runtime.concurrency,
                on_start: runtime.on_start.clone(),
                on_complete: runtime.on_complete.clone(),
                on_success: runtime.on_success.clone(),
                on_failure: runtime.on_failure.clone(),
            });
        };

        let pipeline = middleware::compose(handler, &runtime.middlewares);
        runtime.pipeline = Some(Arc::clone(&pipeline));

        Ok(QueueSnapshot {
            pipeline: Some(pipeline),
            concurrency: runtime.concurrency,
            on_start: runtime.on_start.clone(),
            on_complete: runtime.on_complete.clone(),
            on_success: runtime.on_success.clone(),
            on_failure: runtime.on_failure.clone(),
        })
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("name", &self.name).finish()
    }
}

pub(crate) fn into_request(task: Task) -> Request {
    Request::new(task)
}
