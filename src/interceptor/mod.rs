//! The interceptor chain: tower layers composed around a handler in fixed
//! leaf-to-root order — trace, recover, stat, metrics, breaker, shedding,
//! timeout — so overload rejections happen before any work is spent and
//! panics are observed by the breaker on their way out.
//!
//! Transports adapt their wire types onto [`Request`]/[`Response`]; the
//! chain itself never touches bytes.

mod breaker;
mod metrics;
mod recover;
mod shedding;
mod stat;
mod timeout;
mod trace;

pub use self::breaker::{BreakerLayer, BreakerService};
pub use self::metrics::{MetricsLayer, MetricsService};
pub use self::recover::{RecoverLayer, RecoverService};
pub use self::shedding::{SheddingLayer, SheddingService};
pub use self::stat::{StatLayer, StatService};
pub use self::timeout::{TimeoutLayer, TimeoutService};
pub use self::trace::{TraceLayer, TraceService};

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use shedder::{Shedder, SheddingStat};
use tower::util::BoxCloneService;
use tower::{Layer, Service};

use crate::config::RpcServerConf;
use crate::status::Status;

/// A transport-agnostic request envelope: the full method name, the peer
/// address when known, and the decoded message.
#[derive(Clone, Debug)]
pub struct Request<T> {
    method: Arc<str>,
    remote: Option<SocketAddr>,
    message: T,
}

impl<T> Request<T> {
    pub fn new(method: impl Into<Arc<str>>, message: T) -> Self {
        Self {
            method: method.into(),
            remote: None,
            message,
        }
    }

    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn method_shared(&self) -> Arc<str> {
        Arc::clone(&self.method)
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn into_message(self) -> T {
        self.message
    }
}

#[derive(Clone, Debug)]
pub struct Response<T> {
    message: T,
}

impl<T> Response<T> {
    pub fn new(message: T) -> Self {
        Self { message }
    }

    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn into_message(self) -> T {
        self.message
    }
}

/// The boxed service type the chain produces.
pub type RpcService<T, U> = BoxCloneService<Request<T>, Response<U>, Status>;

/// Composes the full server chain around `handler` according to `conf`.
/// Layer order is fixed; configuration only switches individual layers
/// off (`timeout == 0`, `cpu_threshold == 0`).
pub fn server_chain<S, T, U>(handler: S, conf: &RpcServerConf, stat: SheddingStat) -> RpcService<T, U>
where
    S: Service<Request<T>, Response = Response<U>, Error = Status> + Clone + Send + 'static,
    S::Future: Send + 'static,
    T: Debug + Send + 'static,
    U: Send + 'static,
{
    let shedder = if conf.cpu_threshold > 0 {
        Shedder::builder().cpu_threshold(conf.cpu_threshold).build()
    } else {
        Shedder::nop()
    };

    let mut service: RpcService<T, U> = BoxCloneService::new(handler);
    if conf.timeout > 0 {
        let layer = TimeoutLayer::new(Duration::from_millis(conf.timeout));
        service = BoxCloneService::new(layer.layer(service));
    }
    service = BoxCloneService::new(SheddingLayer::new(shedder, stat).layer(service));
    service = BoxCloneService::new(BreakerLayer::new().layer(service));
    service = BoxCloneService::new(MetricsLayer::new().layer(service));
    service = BoxCloneService::new(StatLayer::new().layer(service));
    service = BoxCloneService::new(RecoverLayer::new().layer(service));
    service = BoxCloneService::new(TraceLayer::new().layer(service));

    service
}
