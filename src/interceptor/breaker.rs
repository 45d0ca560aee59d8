use std::collections::HashMap;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tower::{Layer, Service};

use super::{Request, Response};
use crate::status::Status;

/// One breaker per full method name. Rejections surface as `Unavailable`;
/// unacceptable handler failures and panics feed the failure history.
#[derive(Clone, Debug, Default)]
pub struct BreakerLayer;

impl BreakerLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for BreakerLayer {
    type Service = BreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BreakerService {
            inner,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[derive(Clone)]
pub struct BreakerService<S> {
    inner: S,
    breakers: Arc<Mutex<HashMap<String, ::breaker::Breaker>>>,
}

impl<S> BreakerService<S> {
    fn breaker_for(&self, method: &str) -> ::breaker::Breaker {
        let mut breakers = self.breakers.lock();
        match breakers.get(method) {
            Some(breaker) => breaker.clone(),
            None => {
                let created = ::breaker::Breaker::new(method);
                breakers.insert(method.to_string(), created.clone());
                created
            }
        }
    }
}

impl<S, T, U> Service<Request<T>> for BreakerService<S>
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
        let breaker = self.breaker_for(req.method());

        Box::pin(async move {
            let promise = match breaker.allow() {
                Ok(promise) => promise,
                Err(_) => return Err(Status::unavailable("circuit breaker is open")),
            };

            match AssertUnwindSafe(inner.call(req)).catch_unwind().await {
                Err(panic) => {
                    // the breaker must observe the crash as a failure, the
                    // recover layer above decides what to do with it
                    promise.reject("panic in handler");
                    resume_unwind(panic);
                }
                Ok(Ok(response)) => {
                    promise.accept();
                    Ok(response)
                }
                Ok(Err(status)) => {
                    if status.acceptable() {
                        promise.accept();
                    } else {
                        promise.reject(&status.to_string());
                    }
                    Err(status)
                }
            }
        })
    }
}
