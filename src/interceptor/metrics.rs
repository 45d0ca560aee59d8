use std::sync::OnceLock;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::BoxFuture;
use metrics::{Attributes, Counter, Histogram, Metric};
use tower::{Layer, Service};

use super::{Request, Response};
use crate::status::Status;

const DURATION_BUCKETS: [f64; 12] = [
    1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0,
];

struct ServerMetrics {
    duration: Metric<Histogram>,
    code_total: Metric<Counter>,
}

fn server_metrics() -> &'static ServerMetrics {
    static METRICS: OnceLock<ServerMetrics> = OnceLock::new();
    METRICS.get_or_init(|| ServerMetrics {
        duration: metrics::register_histogram(
            "rpc_server_requests_duration_ms",
            "rpc server requests duration(ms)",
            DURATION_BUCKETS,
        ),
        code_total: metrics::register_counter(
            "rpc_server_requests_code_total",
            "rpc server requests code count",
        ),
    })
}

/// Per-method duration histogram and per-method+code counter.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsLayer;

impl MetricsLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

#[derive(Clone, Debug)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S, T, U> Service<Request<T>> for MetricsService<S>
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
        let method = req.method().to_string();

        Box::pin(async move {
            let start = Instant::now();
            let result = inner.call(req).await;

            let metrics = server_metrics();
            metrics
                .duration
                .recorder(Attributes::new().with("method", method.clone()))
                .record(start.elapsed().as_secs_f64() * 1e3);

            let code = result
                .as_ref()
                .map(|_| 0)
                .unwrap_or_else(|status| status.code().value());
            metrics
                .code_total
                .recorder(
                    Attributes::new()
                        .with("method", method)
                        .with("code", code.to_string()),
                )
                .inc(1);

            result
        })
    }
}
