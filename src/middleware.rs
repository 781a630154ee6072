//! The handler pipeline: middlewares fold right-to-left around the
//! terminal handler at queue-build time into a single composed
//! callable stored on the queue, so dispatching a task is one call
//! regardless of how many middlewares are registered.

use crate::error::Result;
use crate::hooks::Request;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// A user handler, invoked with the fully-hydrated request.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, req: Request) -> Result<Vec<u8>>;
}

pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>>> + Send,
{
    async fn call(&self, req: Request) -> Result<Vec<u8>> {
        (self.0)(req).await
    }
}

/// The composed callable: either the terminal handler, or a
/// middleware closing over the next link in the chain.
pub type Next = Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

/// A middleware wraps `next`, running arbitrary code before and/or
/// after it.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: Next) -> Next;
}

pub(crate) fn compose(handler: Arc<dyn Handler>, middlewares: &[Arc<dyn Middleware>]) -> Next {
    let terminal: Next = Arc::new(move |req| {
        let handler = Arc::clone(&handler);
        Box::pin(async move { handler.call(req).await })
    });

    middlewares
        .iter()
        .rev()
        .fold(terminal, |next, middleware| middleware.wrap(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
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

    #[tokio::test]
    async fn middlewares_run_in_registration_order_around_handler() {
        let order = Arc::new(std::sync::Mutex::new(Vec::<&'static str>::new()));

        struct TraceMiddleware(Arc<std::sync::Mutex<Vec<&'static str>>>, &'static str);
        impl Middleware for TraceMiddleware {
            fn wrap(&self, next: Next) -> Next {
                let order = Arc::clone(&self.0);
                let name = self.1;
                Arc::new(move |req| {
                    order.lock().unwrap().push(name);
                    next(req)
                })
            }
        }

        let handler: Arc<dyn Handler> = Arc::new(FnHandler(|_req: Request| async move {
            Ok(b"done".to_vec())
        }));

        let middlewares: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(TraceMiddleware(Arc::clone(&order), "first")),
            Arc::new(TraceMiddleware(Arc::clone(&order), "second")),
        ];

        let pipeline = compose(handler, &middlewares);
        let result = pipeline(Request::new(sample_task())).await.unwrap();

        assert_eq!(result, b"done");
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn middleware_can_short_circuit_before_handler() {
        struct ShortCircuit;
        impl Middleware for ShortCircuit {
            fn wrap(&self, _next: Next) -> Next {
                Arc::new(|_req| Box::pin(async { Ok(b"short-circuited".to_vec()) }))
            }
        }

        let counter = Arc::new(AtomicUsize::new(0));
        let handler: Arc<dyn Handler> = {
            let counter = Arc::clone(&counter);
            Arc::new(FnHandler(move |_req: Request| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(b"unreachable".to_vec())
                }
            }))
        };

        let middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(ShortCircuit)];
        let pipeline = compose(handler, &middlewares);
        let result = pipeline(Request::new(sample_task())).await.unwrap();

        assert_eq!(result, b"short-circuited");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
