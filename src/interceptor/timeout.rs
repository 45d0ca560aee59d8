use std::panic::resume_unwind;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use tower::{Layer, Service};

use super::{Request, Response};
use crate::status::Status;

/// Bounds the handler with a deadline by running it on an isolated worker
/// task. On deadline the caller gets `DeadlineExceeded` immediately; the
/// worker runs to completion and its result is discarded. A worker panic
/// is republished on the calling task.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutLayer {
    timeout: Duration,
}

impl TimeoutLayer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Duration,
}

impl<S, T, U> Service<Request<T>> for TimeoutService<S>
where
    S: Service<Request<T>, Response = Response<U>, Error = Status> + Clone + Send + 'static,
    S::Future: Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    type Response = Response<U>;
    type Error = Status;
    type Future = BoxFuture<'static, Result<Response<U>, Status>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<T>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let timeout = self.timeout;

        Box::pin(async move {
            if timeout.is_zero() {
                return inner.call(req).await;
            }

            let mut worker = tokio::spawn(async move { inner.call(req).await });

            tokio::select! {
                joined = &mut worker => match joined {
                    Ok(result) => result,
                    Err(err) if err.is_panic() => resume_unwind(err.into_panic()),
                    Err(_) => Err(Status::canceled("handler task cancelled")),
                },
                _ = tokio::time::sleep(timeout) => {
                    Err(Status::deadline_exceeded(format!(
                        "deadline exceeded after {}ms",
                        timeout.as_millis()
                    )))
                }
            }
        })
    }
}
