use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tower::{Layer, Service};

use super::{Request, Response};
use crate::status::Status;

const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(500);

/// Duration accounting plus one structured log line per call. Calls slower
/// than the threshold are logged at warn level as slowcalls. Request
/// content is included unless the method opted out (large or binary
/// payloads).
#[derive(Clone, Debug)]
pub struct StatLayer {
    slow_threshold: Duration,
    ignore_content: Arc<HashSet<String>>,
}

impl Default for StatLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl StatLayer {
    pub fn new() -> Self {
        Self {
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
            ignore_content: Arc::new(HashSet::new()),
        }
    }

    pub fn slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Suppresses content logging for the given full method names.
    pub fn ignore_content_for<I, M>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        self.ignore_content = Arc::new(methods.into_iter().map(Into::into).collect());
        self
    }
}

impl<S> Layer<S> for StatLayer {
    type Service = StatService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        StatService {
            inner,
            slow_threshold: self.slow_threshold,
            ignore_content: Arc::clone(&self.ignore_content),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StatService<S> {
    inner: S,
    slow_threshold: Duration,
    ignore_content: Arc<HashSet<String>>,
}

impl<S, T, U> Service<Request<T>> for StatService<S>
where
    S: Service<Request<T>, Response = Response<U>, Error = Status> + Clone + Send + 'static,
    S::Future: Send + 'static,
    T: Debug + Send + 'static,
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
        let remote = req.remote().map(|addr| addr.to_string()).unwrap_or_default();
        let content = (!self.ignore_content.contains(req.method()))
            .then(|| format!("{:?}", req.message()));
        let slow_threshold = self.slow_threshold;

        Box::pin(async move {
            let start = Instant::now();
            let result = inner.call(req).await;
            let duration = start.elapsed();

            let duration_ms = duration.as_millis() as u64;
            match &content {
                Some(content) if duration > slow_threshold => warn!(
                    message = "[rpc] slowcall",
                    method = %method,
                    remote = %remote,
                    duration_ms,
                    content = %content,
                ),
                Some(content) => info!(
                    message = "[rpc] finished",
                    method = %method,
                    remote = %remote,
                    duration_ms,
                    content = %content,
                ),
                None if duration > slow_threshold => warn!(
                    message = "[rpc] slowcall",
                    method = %method,
                    remote = %remote,
                    duration_ms,
                ),
                None => info!(
                    message = "[rpc] finished",
                    method = %method,
                    remote = %remote,
                    duration_ms,
                ),
            }

            result
        })
    }
}
