//! girder: the service-governance core of a microservice framework.
//!
//! The pieces that keep an RPC/HTTP server responsive under load spikes,
//! latency fanout and partial failure: an adaptive CPU-aware shedder, a
//! probabilistic client-side breaker, a P2C+EWMA balancer, a local
//! expiring cache and a coordinator-backed service registry, tied together
//! by a tower interceptor chain and a signal-driven lifecycle.
//!
//! Transports are deliberately out of scope; the interceptors operate on
//! the minimal [`interceptor::Request`]/[`interceptor::Response`] envelope
//! and any gRPC/HTTP adapter maps its wire types onto it.

pub mod client;
pub mod config;
pub mod group;
pub mod interceptor;
pub mod proc;
pub mod status;

pub use client::{Channel, Connector};
pub use config::{
    EtcdConf, GatewayConf, Mode, RedisConf, RestConf, RpcClientConf, RpcServerConf, ServiceConf,
};
pub use group::{Service, ServiceGroup};
pub use status::{Code, Status};

// the building blocks, re-exported so embedders depend on one crate
pub use balance;
pub use breaker;
pub use cache;
pub use discovery;
pub use flight;
pub use metrics;
pub use rolling;
pub use shedder;
pub use sysload;
pub use timewheel;

#[macro_use]
extern crate tracing;

/// Boxed error for glue code that aggregates heterogeneous failures.
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias defined in terms of [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
