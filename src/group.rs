//! A group of long-running services started together and stopped in
//! reverse registration order, wired into the process shutdown listeners.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

/// A long-running unit: `start` blocks until the service exits (usually
/// prompted by `stop`).
#[async_trait]
pub trait Service: Send + Sync {
    async fn start(&self) -> crate::Result<()>;

    async fn stop(&self);
}

/// Services in a group have no mutual start ordering; they are started on
/// parallel tasks. Stop order is the reverse of registration.
#[derive(Clone, Default)]
pub struct ServiceGroup {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    services: Mutex<Vec<Arc<dyn Service>>>,
    stopped: AtomicBool,
}

impl ServiceGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, service: Arc<dyn Service>) {
        self.inner.services.lock().push(service);
    }

    /// Starts every service and blocks until they have all returned.
    /// Registers the group's stop as a process shutdown listener, so a
    /// signal unwinds the group cleanly.
    pub async fn start(&self) {
        crate::proc::setup_signals();

        let group = self.clone();
        let handle = tokio::runtime::Handle::current();
        crate::proc::add_shutdown_listener(move || {
            info!(message = "shutting down services in group");
            handle.block_on(group.stop());
        });

        let services: Vec<_> = self.inner.services.lock().clone();
        let mut tasks = tokio::task::JoinSet::new();
        for service in services {
            tasks.spawn(async move { service.start().await });
        }

        while let Some(finished) = tasks.join_next().await {
            match finished {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(message = "service exited with error", error = %err),
                Err(err) if err.is_panic() => {
                    error!(message = "service panicked", error = %err)
                }
                Err(_) => {}
            }
        }
    }

    /// Stops every service, newest first. Safe to call more than once.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let services: Vec<_> = self.inner.services.lock().clone();
        for service in services.iter().rev() {
            service.stop().await;
        }
    }
}
