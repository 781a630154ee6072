//! The top-level handle: owns the broker and serializer, the named
//! queue registry, and the background loops (one consumer per
//! subscribed queue, plus a delayed-task promoter) spawned by `run`.

use crate::broker::{Broker, MemoryBroker, RedisBroker, RedisBrokerConfig};
use crate::consumer::Consumer;
use crate::error::Result;
use crate::options::{QueueOptions, TaskDefaults};
use crate::queue::Queue;
use crate::serializer::{JsonSerializer, Serializer};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often the promoter sweeps every queue's delayed set looking for
/// tasks whose `eta` has arrived.
const PROMOTE_INTERVAL: Duration = Duration::from_secs(1);

/// Which concrete `Broker` a fresh `Engine` should connect, resolved at
/// construction time rather than passed as a trait object by callers
/// who just want the default storage for their environment.
pub enum BrokerKind {
    Redis(RedisBrokerConfig),
    Memory,
}

pub struct Engine {
    broker: Arc<dyn Broker>,
    serializer: Arc<dyn Serializer>,
    defaults: TaskDefaults,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    promote_interval: Duration,
}

impl Engine {
    /// Connect `kind` and verify it's reachable before returning.
    pub async fn new(kind: BrokerKind, defaults: TaskDefaults) -> Result<Self> {
        let broker: Arc<dyn Broker> = match kind {
            BrokerKind::Redis(config) => Arc::new(RedisBroker::connect(&config).await?),
            BrokerKind::Memory => Arc::new(MemoryBroker::new()),
        };
        broker.initialize().await?;

        Ok(Self {
            broker,
            serializer: Arc::new(JsonSerializer),
            defaults,
            queues: RwLock::new(HashMap::new()),
            promote_interval: PROMOTE_INTERVAL,
        })
    }

    /// Build an engine around an already-constructed broker, for
    /// callers supplying a custom driver that isn't `BrokerKind`.
    pub async fn with_broker(broker: Arc<dyn Broker>, defaults: TaskDefaults) -> Result<Self> {
        broker.initialize().await?;
        Ok(Self {
            broker,
            serializer: Arc::new(JsonSerializer),
            defaults,
            queues: RwLock::new(HashMap::new()),
            promote_interval: PROMOTE_INTERVAL,
        })
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Override how often the delayed-task promoter sweeps (default 1s,
    /// per-queue granularity). Useful for shorter retry/countdown
    /// windows than the default tick would comfortably serve.
    pub fn with_promote_interval(mut self, interval: Duration) -> Self {
        self.promote_interval = interval;
        self
    }

    /// Get or create the named queue, inheriting the engine's defaults.
    pub fn queue(&self, name: &str) -> Arc<Queue> {
        self.queue_with_options(name, QueueOptions::default())
    }

    /// Get or create the named queue, applying `options` over the
    /// engine's defaults the first time it's created. Ignored on
    /// subsequent calls for an already-registered queue.
    pub fn queue_with_options(&self, name: &str, options: QueueOptions) -> Arc<Queue> {
        if let Some(queue) = self.queues.read().expect("queue registry lock poisoned").get(name) {
            return Arc::clone(queue);
        }

        let mut queues = self.queues.write().expect("queue registry lock poisoned");
        queues
            .entry(name.to_string())
            .or_insert_with(|| {
                let defaults = options.resolve(&self.defaults);
                Arc::new(Queue::new(
                    name,
                    Arc::clone(&self.broker),
                    Arc::clone(&self.serializer),
                    defaults,
                ))
            })
            .clone()
    }

    /// Shorthand for `engine.queue(name).publish(value, options)`.
    pub async fn publish<T: serde::Serialize>(
        &self,
        queue: &str,
        value: &T,
        options: crate::options::PublishOptions,
    ) -> Result<crate::task::Task> {
        self.queue(queue).publish(value, options).await
    }

    /// Run every registered queue's consumer plus the delayed-task
    /// promoter, returning once `shutdown` is canceled and all
    /// in-flight tasks have drained.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let queues: Vec<Arc<Queue>> = self
            .queues
            .read()
            .expect("queue registry lock poisoned")
            .values()
            .cloned()
            .collect();

        let mut handles: Vec<JoinHandle<Result<()>>> = Vec::with_capacity(queues.len() + 1);

        for queue in &queues {
            let consumer = Consumer::new(Arc::clone(queue));
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move { consumer.run(token).await }));
        }

        handles.push(tokio::spawn(promote_loop(
            Arc::clone(&self.broker),
            queues.iter().map(|q| q.name().to_string()).collect(),
            shutdown.clone(),
            self.promote_interval,
        )));

        for handle in handles {
            handle.await.map_err(|err| {
                crate::error::Error::Broker(format!("consumer task panicked: {err}"))
            })??;
        }

        Ok(())
    }

    /// Signal every running consumer and the promoter to stop; does
    /// not block until they've drained (await `run`'s return for that).
    pub fn stop(&self, shutdown: &CancellationToken) {
        shutdown.cancel();
    }
}

async fn promote_loop(
    broker: Arc<dyn Broker>,
    queue_names: Vec<String>,
    shutdown: CancellationToken,
    interval: Duration,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                let now = chrono::Utc::now();
                for name in &queue_names {
                    if let Err(err) = broker.promote_delayed(name, now).await {
                        tracing::warn!(queue = %name, error = %err, "promote_delayed failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Request;
    use crate::middleware::FnHandler;
    use crate::options::{PublishOptions, SubscribeOptions};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn queue_is_created_once_and_reused() {
        let engine = Engine::with_broker(Arc::new(MemoryBroker::new()), TaskDefaults::default())
            .await
            .unwrap();

        let a = engine.queue("jobs");
        let b = engine.queue("jobs");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn run_drives_subscribed_queue_and_stops_on_shutdown() {
        let engine = Engine::with_broker(Arc::new(MemoryBroker::new()), TaskDefaults::default())
            .await
            .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let handler_ran = Arc::clone(&ran);
        let queue = engine.queue("jobs");
        queue.subscribe(
            FnHandler(move |_req: Request| {
                let ran = Arc::clone(&handler_ran);
                async move {
                    ran.store(true, Ordering::SeqCst);
                    Ok(Vec::new())
                }
            }),
            SubscribeOptions { concurrency: 1 },
        );

        engine.publish("jobs", &"x", PublishOptions::new()).await.unwrap();

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let engine = Arc::new(engine);
        let engine_run = Arc::clone(&engine);
        let handle = tokio::spawn(async move { engine_run.run(token).await });

        tokio::time::sleep(StdDuration::from_millis(200)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert!(ran.load(Ordering::SeqCst));
    }
}
