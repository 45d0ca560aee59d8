use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tower::{Layer, Service};

use super::{Request, Response};
use crate::status::Status;

/// The crash barrier: a panic anywhere below becomes an `Internal` status
/// instead of tearing down the transport worker.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecoverLayer;

impl RecoverLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RecoverLayer {
    type Service = RecoverService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoverService { inner }
    }
}

#[derive(Clone, Debug)]
pub struct RecoverService<S> {
    inner: S,
}

impl<S, T, U> Service<Request<T>> for RecoverService<S>
where
    S: Service<Request<T>, Response = Response<U>, Error = Status> + Clone + Send + 'static,
    S::Future: Send + 'static,
    T: Send + 'static,
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
        let method = req.method_shared();

        Box::pin(async move {
            match AssertUnwindSafe(inner.call(req)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let reason = panic_message(&panic);
                    error!(message = "handler panicked", method = %method, %reason);
                    Err(Status::internal(format!("panic: {reason}")))
                }
            }
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
