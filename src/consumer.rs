//! Drives handlers for a single queue: one shared blocking-dequeue loop
//! hands tasks off to a bounded pool of workers through an in-process
//! channel, so no worker polls the broker independently.

use crate::error::{Error, Result};
use crate::hooks::HookEvent;
use crate::queue::{self, Queue, QueueSnapshot};
use crate::serializer;
use crate::task::{Task, TaskStatus};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Server-side timeout on each blocking dequeue call, bounding how long
/// it takes the loop to notice shutdown once the live list is empty.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Dequeues for one queue and dispatches to its worker pool.
pub(crate) struct Consumer {
    queue: Arc<Queue>,
}

impl Consumer {
    pub(crate) fn new(queue: Arc<Queue>) -> Self {
        Self { queue }
    }

    /// Runs until `shutdown` is canceled. Workers already holding a
    /// task are allowed to finish; the dequeue loop simply stops
    /// requesting new ones.
    pub(crate) async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let snapshot = self.queue.snapshot()?;
        let Some(pipeline) = snapshot.pipeline.clone() else {
            tracing::debug!(queue = self.queue.name(), "no handler subscribed, idling");
            shutdown.cancelled().await;
            return Ok(());
        };

        let concurrency = snapshot.concurrency.max(1);
        let (tx, rx) = tokio::sync::mpsc::channel::<(String, Vec<u8>)>(concurrency);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let rx = Arc::clone(&rx);
            let queue = Arc::clone(&self.queue);
            let snapshot = QueueSnapshot {
                pipeline: Some(Arc::clone(&pipeline)),
                concurrency: snapshot.concurrency,
                on_start: snapshot.on_start.clone(),
                on_complete: snapshot.on_complete.clone(),
                on_success: snapshot.on_success.clone(),
                on_failure: snapshot.on_failure.clone(),
            };
            let worker_shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, queue, snapshot, rx, worker_shutdown).await;
            }));
        }

        let queue_name = self.queue.name().to_string();
        let broker = self.queue.broker();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let popped = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = broker.consume(std::slice::from_ref(&queue_name), DEQUEUE_TIMEOUT) => result,
            };

            match popped {
                Ok(Some((_, id, data))) => {
                    if tx.send((id, data)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(queue = %queue_name, error = %err, "dequeue failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<Queue>,
    snapshot: QueueSnapshot,
    rx: Arc<Mutex<tokio::sync::mpsc::Receiver<(String, Vec<u8>)>>>,
    shutdown: CancellationToken,
) {
    loop {
        let item = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some((id, data)) = item else { break };
        if let Err(err) = execute_task(&queue, &snapshot, &id, data, &shutdown).await {
            tracing::error!(worker_id, task_id = %id, error = %err, "task execution failed");
        }
    }
}

/// Runs the full lifecycle for one dequeued task: decode, dispatch
/// through the middleware pipeline under a deadline, apply the
/// success/retry/failure transition, and persist the terminal record.
async fn execute_task(
    queue: &Queue,
    snapshot: &QueueSnapshot,
    id: &str,
    data: Vec<u8>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut task = match serializer::decode::<Task>(queue.serializer().as_ref(), &data) {
        Ok(task) => task,
        Err(err) => {
            tracing::error!(task_id = %id, error = %err, "corrupt task record, not retrying");
            return quarantine(queue, id, err.to_string()).await;
        }
    };

    if task.status.is_terminal() {
        tracing::debug!(task_id = %task.id, status = ?task.status, "already terminal, skipping");
        let event = HookEvent {
            task: task.clone(),
            succeeded: task.status == TaskStatus::Succeeded,
            error: task.error.clone(),
            timed_out: false,
        };
        return complete(queue, snapshot, task, event).await;
    }

    task.retried += 1;
    task.status = TaskStatus::Processing;
    task.started_at = Some(Utc::now());

    let mut request = queue::into_request(task.clone());
    for hook in &snapshot.on_start {
        match hook.on_start(request).await {
            Ok(next) => request = next,
            Err(err) => return fail(queue, snapshot, task, err.to_string(), false, shutdown).await,
        }
    }
    task = request.task.clone();

    let pipeline = snapshot
        .pipeline
        .clone()
        .expect("execute_task only called when a handler is subscribed");

    let outcome = tokio::time::timeout(task.timeout, pipeline(request)).await;

    match outcome {
        Ok(Ok(result)) => {
            task.status = TaskStatus::Succeeded;
            task.result = Some(result);
            task.processed_at = Some(Utc::now());
            task.exec_time = elapsed_secs(&task);
            task.error = None;

            let event = HookEvent {
                task: task.clone(),
                succeeded: true,
                error: None,
                timed_out: false,
            };
            for hook in &snapshot.on_success {
                hook.on_event(event.clone()).await;
            }
            complete(queue, snapshot, task, event).await
        }
        Ok(Err(err)) => fail(queue, snapshot, task, err.to_string(), false, shutdown).await,
        Err(_elapsed) => {
            let err = Error::Timeout(task.timeout);
            fail(queue, snapshot, task, err.to_string(), true, shutdown).await
        }
    }
}

/// Persists a minimal `Failed` record for a task id whose payload
/// could not be decoded, so it leaves the live list in terminal
/// metadata (ttl>0) instead of vanishing untracked.
async fn quarantine(queue: &Queue, id: &str, reason: String) -> Result<()> {
    let now = Utc::now();
    let task = Task {
        id: id.to_string(),
        name: queue.name().to_string(),
        payload: Vec::new(),
        status: TaskStatus::Failed,
        published_at: None,
        started_at: Some(now),
        processed_at: Some(now),
        exec_time: 0.0,
        eta: None,
        max_retries: 0,
        retried: 1,
        retry_intervals: Vec::new(),
        timeout: queue.defaults().timeout,
        ttl: queue.defaults().ttl,
        error: Some(reason),
        result: None,
    };
    let bytes = serializer::encode(queue.serializer().as_ref(), &task)?;
    queue.broker().set(queue.name(), id, &bytes, task.ttl).await
}

fn elapsed_secs(task: &Task) -> f64 {
    match (task.started_at, task.processed_at) {
        (Some(started), Some(processed)) => {
            (processed - started).num_milliseconds() as f64 / 1000.0
        }
        _ => 0.0,
    }
}

/// Shared failure path: decide between scheduling a retry and declaring
/// the task permanently failed, then fire `on_failure` either way.
/// A task that still has retries left is nonetheless declared
/// permanently failed, with no retry scheduled, once `shutdown` has
/// been signaled — the engine is tearing down and won't be around to
/// dequeue the republished copy.
async fn fail(
    queue: &Queue,
    snapshot: &QueueSnapshot,
    mut task: Task,
    message: String,
    timed_out: bool,
    shutdown: &CancellationToken,
) -> Result<()> {
    task.error = Some(message.clone());

    if task.retries_remaining() && !shutdown.is_cancelled() {
        let attempt_index = task.retried.saturating_sub(1);
        let delay = task.retry_delay(attempt_index);
        let eta = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

        let event = HookEvent {
            task: task.clone(),
            succeeded: false,
            error: Some(message),
            timed_out,
        };
        for hook in &snapshot.on_failure {
            hook.on_event(event.clone()).await;
        }

        tracing::info!(
            task_id = %task.id,
            attempt = task.retried,
            max_retries = task.max_retries,
            "scheduling retry"
        );
        queue.republish(task, eta).await?;
        return Ok(());
    }

    if shutdown.is_cancelled() && task.retries_remaining() {
        tracing::info!(task_id = %task.id, "shutting down, not rescheduling retry");
    }

    task.status = TaskStatus::Failed;
    task.processed_at = Some(Utc::now());
    task.exec_time = elapsed_secs(&task);

    let event = HookEvent {
        task: task.clone(),
        succeeded: false,
        error: Some(message),
        timed_out,
    };
    for hook in &snapshot.on_failure {
        hook.on_event(event.clone()).await;
    }
    complete(queue, snapshot, task, event).await
}

/// Always-run tail: fire `on_complete` and persist the terminal record
/// with its TTL.
async fn complete(
    queue: &Queue,
    snapshot: &QueueSnapshot,
    task: Task,
    event: HookEvent,
) -> Result<()> {
    for hook in &snapshot.on_complete {
        hook.on_event(event.clone()).await;
    }

    let bytes = serializer::encode(queue.serializer().as_ref(), &task)?;
    queue
        .broker()
        .set(queue.name(), &task.id, &bytes, task.ttl)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::hooks::Request;
    use crate::middleware::FnHandler;
    use crate::options::{PublishOptions, SubscribeOptions, TaskDefaults};
    use crate::serializer::JsonSerializer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn new_queue() -> Arc<Queue> {
        let broker: Arc<dyn crate::broker::Broker> = Arc::new(MemoryBroker::new());
        let serializer: Arc<dyn crate::serializer::Serializer> = Arc::new(JsonSerializer);
        Arc::new(Queue::new("jobs", broker, serializer, TaskDefaults::default()))
    }

    #[tokio::test]
    async fn successful_task_is_marked_succeeded() {
        let queue = new_queue();
        queue.subscribe(
            FnHandler(|_req: Request| async move { Ok(b"ok".to_vec()) }),
            SubscribeOptions { concurrency: 1 },
        );

        let published = queue.publish(&"payload", PublishOptions::new()).await.unwrap();

        let shutdown = CancellationToken::new();
        let consumer = Consumer::new(Arc::clone(&queue));
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { consumer.run(token).await });

        tokio::time::sleep(StdDuration::from_millis(200)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let task = queue.get(&published.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.result, Some(b"ok".to_vec()));
    }

    #[tokio::test]
    async fn failure_is_retried_until_exhausted_then_failed() {
        let queue = new_queue();
        let attempts = Arc::new(AtomicUsize::new(0));
        let handler_attempts = Arc::clone(&attempts);
        queue.subscribe(
            FnHandler(move |_req: Request| {
                let attempts = Arc::clone(&handler_attempts);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Handler("boom".into()))
                }
            }),
            SubscribeOptions { concurrency: 1 },
        );

        let published = queue
            .publish(
                &"payload",
                PublishOptions::new()
                    .with_max_retries(2)
                    .with_retry_intervals(vec![StdDuration::from_millis(10)]),
            )
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let consumer = Consumer::new(Arc::clone(&queue));
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { consumer.run(token).await });

        // Three attempts (1 initial + 2 retries), each needing a promotion
        // of the delayed retry back onto the live list.
        for _ in 0..3 {
            tokio::time::sleep(StdDuration::from_millis(30)).await;
            queue.broker().promote_delayed(queue.name(), Utc::now()).await.unwrap();
        }
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let task = queue.get(&published.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn timed_out_handler_is_recorded_as_timeout() {
        let queue = new_queue();
        queue.subscribe(
            FnHandler(|_req: Request| async move {
                tokio::time::sleep(StdDuration::from_secs(5)).await;
                Ok(Vec::new())
            }),
            SubscribeOptions { concurrency: 1 },
        );

        let published = queue
            .publish(
                &"payload",
                PublishOptions::new()
                    .with_timeout(StdDuration::from_millis(20))
                    .with_max_retries(0),
            )
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let consumer = Consumer::new(Arc::clone(&queue));
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { consumer.run(token).await });

        tokio::time::sleep(StdDuration::from_millis(300)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let task = queue.get(&published.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn corrupt_record_is_quarantined_as_failed() {
        let queue = new_queue();
        queue.subscribe(
            FnHandler(|_req: Request| async move { Ok(Vec::new()) }),
            SubscribeOptions { concurrency: 1 },
        );

        queue
            .broker()
            .publish(queue.name(), "bad-id", b"not a task record", None)
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let consumer = Consumer::new(Arc::clone(&queue));
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { consumer.run(token).await });

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let task = queue.get("bad-id").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());
    }

    #[tokio::test]
    async fn already_terminal_task_still_fires_on_complete() {
        let queue = new_queue();
        queue.subscribe(
            FnHandler(|_req: Request| async move { Ok(Vec::new()) }),
            SubscribeOptions { concurrency: 1 },
        );

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let hook_fired = Arc::clone(&fired);
        queue.on_complete(crate::hooks::FnEventHook(move |_event| {
            let fired = Arc::clone(&hook_fired);
            async move {
                fired.store(true, Ordering::SeqCst);
            }
        }));

        let task = crate::task::Task {
            id: "already-done".into(),
            name: queue.name().to_string(),
            payload: Vec::new(),
            status: TaskStatus::Succeeded,
            published_at: Some(Utc::now()),
            started_at: Some(Utc::now()),
            processed_at: Some(Utc::now()),
            exec_time: 0.0,
            eta: None,
            max_retries: 0,
            retried: 1,
            retry_intervals: Vec::new(),
            timeout: StdDuration::from_secs(1),
            ttl: StdDuration::from_secs(60),
            error: None,
            result: Some(b"done".to_vec()),
        };
        let bytes = serializer::encode(queue.serializer().as_ref(), &task).unwrap();
        queue
            .broker()
            .publish(queue.name(), &task.id, &bytes, None)
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let consumer = Consumer::new(Arc::clone(&queue));
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { consumer.run(token).await });

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert!(fired.load(Ordering::SeqCst));
        let persisted = queue.get("already-done").await.unwrap().unwrap();
        assert_eq!(persisted.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn shutdown_in_progress_skips_retry_and_marks_failed() {
        let queue = new_queue();
        queue.subscribe(
            FnHandler(|_req: Request| async move {
                tokio::time::sleep(StdDuration::from_millis(50)).await;
                Err(Error::Handler("boom".into()))
            }),
            SubscribeOptions { concurrency: 1 },
        );

        let published = queue
            .publish(
                &"payload",
                PublishOptions::new()
                    .with_max_retries(5)
                    .with_retry_intervals(vec![StdDuration::from_millis(10)]),
            )
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let consumer = Consumer::new(Arc::clone(&queue));
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { consumer.run(token).await });

        tokio::time::sleep(StdDuration::from_millis(15)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let task = queue.get(&published.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retried, 1);
    }
}
