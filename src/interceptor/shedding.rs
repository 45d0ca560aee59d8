use std::panic::{resume_unwind, AssertUnwindSafe};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use shedder::{Shedder, SheddingStat};
use tower::{Layer, Service};

use super::{Request, Response};
use crate::status::Status;

/// Admission control in front of the handler. Drops surface as
/// `ResourceExhausted`; admitted requests resolve their promise exactly
/// once, panics included.
#[derive(Clone)]
pub struct SheddingLayer {
    shedder: Shedder,
    stat: SheddingStat,
}

impl SheddingLayer {
    pub fn new(shedder: Shedder, stat: SheddingStat) -> Self {
        Self { shedder, stat }
    }
}

impl<S> Layer<S> for SheddingLayer {
    type Service = SheddingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SheddingService {
            inner,
            shedder: self.shedder.clone(),
            stat: self.stat.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SheddingService<S> {
    inner: S,
    shedder: Shedder,
    stat: SheddingStat,
}

impl<S, T, U> Service<Request<T>> for SheddingService<S>
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
        let shedder = self.shedder.clone();
        let stat = self.stat.clone();

        Box::pin(async move {
            stat.increment_total();
            let promise = match shedder.allow() {
                Ok(promise) => promise,
                Err(_) => {
                    stat.increment_drop();
                    error!(message = "[rpc] dropped", method = %req.method());
                    return Err(Status::resource_exhausted("service overloaded"));
                }
            };

            match AssertUnwindSafe(inner.call(req)).catch_unwind().await {
                Err(panic) => {
                    promise.fail();
                    resume_unwind(panic);
                }
                Ok(Ok(response)) => {
                    promise.pass();
                    stat.increment_pass();
                    Ok(response)
                }
                Ok(Err(status)) => {
                    promise.fail();
                    Err(status)
                }
            }
        })
    }
}
