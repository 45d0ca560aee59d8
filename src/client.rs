//! Outbound side: a load-balanced channel that follows a discovery prefix,
//! guards every call with a per-target breaker and routes through the P2C
//! picker. The wire protocol stays outside; callers hand in a closure that
//! drives their own connection handle.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use balance::P2cPicker;
use discovery::{Registry, UpdateListener, KV};
use parking_lot::Mutex;

use crate::status::Status;

/// Turns an address into a connection handle. Handles are expected to be
/// cheap to clone (pooled or multiplexed underneath).
pub trait Connector: Send + Sync + 'static {
    type Conn: Clone + Send + Sync + 'static;

    fn connect(&self, addr: &str) -> Self::Conn;
}

/// A load-balanced virtual connection to one logical service.
pub struct Channel<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for Channel<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C: Connector> {
    target: String,
    connector: C,
    timeout: Mutex<Option<Duration>>,
    // keyed by the discovery key; the value is (address, handle)
    conns: Mutex<HashMap<String, (String, C::Conn)>>,
    picker: Mutex<Option<P2cPicker<C::Conn, Status>>>,
}

impl<C: Connector> Channel<C> {
    /// A channel over a fixed address list, for clients configured with
    /// direct endpoints instead of a registry.
    pub fn with_addrs(
        target: impl Into<String>,
        connector: C,
        addrs: impl IntoIterator<Item = String>,
    ) -> Self {
        let channel = Self::empty(target, connector);
        {
            let mut conns = channel.inner.conns.lock();
            for addr in addrs {
                let conn = channel.inner.connector.connect(&addr);
                conns.insert(addr.clone(), (addr, conn));
            }
        }
        channel.inner.rebuild();

        channel
    }

    /// A channel fed by the keys under `prefix` on the given registry;
    /// values are expected to be dialable addresses.
    pub async fn subscribe(
        registry: &Registry,
        endpoints: &[String],
        prefix: &str,
        connector: C,
    ) -> Result<Self, discovery::Error> {
        let channel = Self::empty(prefix, connector);
        let listener = Arc::new(Subscription {
            inner: Arc::downgrade(&channel.inner),
        });
        registry.monitor(endpoints, prefix, listener).await?;

        Ok(channel)
    }

    fn empty(target: impl Into<String>, connector: C) -> Self {
        Self {
            inner: Arc::new(Inner {
                target: target.into(),
                connector,
                timeout: Mutex::new(None),
                conns: Mutex::new(HashMap::new()),
                picker: Mutex::new(None),
            }),
        }
    }

    /// Bounds every call with a deadline; `DeadlineExceeded` when it hits.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        *self.inner.timeout.lock() = Some(timeout);
        self
    }

    /// The balanced call path: breaker, pick, wire, completion. `f` runs
    /// the actual request against the chosen connection handle.
    pub async fn call<R, F, Fut>(&self, method: &str, f: F) -> Result<R, Status>
    where
        F: FnOnce(C::Conn) -> Fut,
        Fut: Future<Output = Result<R, Status>>,
    {
        let name = format!("{}/{}", self.inner.target, method);
        let breaker = ::breaker::get_or_create(&name);
        let promise = breaker
            .allow()
            .map_err(|_| Status::unavailable("circuit breaker is open"))?;

        let picker = self.inner.picker.lock().clone();
        let picked = picker.as_ref().and_then(|p| p.pick().ok());
        let Some((conn, completion)) = picked else {
            promise.reject("no sub-connection available");
            return Err(Status::unavailable("no sub-connection available"));
        };

        let timeout = *self.inner.timeout.lock();
        let result = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, f(conn.conn().clone())).await {
                Ok(result) => result,
                Err(_) => Err(Status::deadline_exceeded(format!(
                    "deadline exceeded after {}ms",
                    timeout.as_millis()
                ))),
            },
            None => f(conn.conn().clone()).await,
        };
        completion.done(result.as_ref().err());

        match &result {
            Ok(_) => promise.accept(),
            Err(status) if status.acceptable() => promise.accept(),
            Err(status) => promise.reject(status.message()),
        }

        result
    }

    /// The addresses currently backing this channel, for logging and
    /// health surfaces.
    pub fn addrs(&self) -> Vec<String> {
        let conns = self.inner.conns.lock();
        let mut addrs: Vec<_> = conns.values().map(|(addr, _)| addr.clone()).collect();
        addrs.sort();
        addrs
    }
}

impl<C: Connector> Inner<C> {
    fn rebuild(&self) {
        let conns: Vec<(String, C::Conn)> = self
            .conns
            .lock()
            .values()
            .map(|(addr, conn)| (addr.clone(), conn.clone()))
            .collect();

        let picker = if conns.is_empty() {
            None
        } else {
            Some(P2cPicker::new(conns, |status: &Status| status.acceptable()))
        };
        *self.picker.lock() = picker;
    }
}

/// The discovery listener half of a channel. Holds the channel weakly so
/// an abandoned channel does not stay subscribed through the registry.
struct Subscription<C: Connector> {
    inner: Weak<Inner<C>>,
}

impl<C: Connector> UpdateListener for Subscription<C> {
    fn on_add(&self, kv: KV) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        info!(message = "upstream added", target = %inner.target, key = %kv.key, addr = %kv.value);
        let conn = inner.connector.connect(&kv.value);
        inner.conns.lock().insert(kv.key, (kv.value, conn));
        inner.rebuild();
    }

    fn on_delete(&self, kv: KV) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        info!(message = "upstream removed", target = %inner.target, key = %kv.key);
        inner.conns.lock().remove(&kv.key);
        inner.rebuild();
    }
}
