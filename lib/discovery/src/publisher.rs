use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};

use crate::{Error, KvClient, Registry};

// lease ttl for published keys
const TIME_TO_LIVE: i64 = 10;
const RECOVER_INTERVAL: Duration = Duration::from_secs(1);

/// Publishes one `key -> value` pair (typically service name to listen
/// address) under a coordinator lease, renewing it until stopped.
pub struct Publisher {
    endpoints: Vec<String>,
    key: String,
    value: String,
    id: Option<i64>,
    registry: &'static Registry,
    quit: watch::Sender<bool>,
    pause_tx: mpsc::Sender<()>,
    resume_tx: mpsc::Sender<()>,
    workers: Option<(mpsc::Receiver<()>, mpsc::Receiver<()>)>,
}

struct Inner {
    key: String,
    value: String,
    id: Option<i64>,
}

impl Publisher {
    pub fn new(endpoints: Vec<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with_registry(Registry::global(), endpoints, key, value)
    }

    pub fn with_registry(
        registry: &'static Registry,
        endpoints: Vec<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let (quit, _) = watch::channel(false);
        let (pause_tx, pause_rx) = mpsc::channel(1);
        let (resume_tx, resume_rx) = mpsc::channel(1);

        Self {
            endpoints,
            key: key.into(),
            value: value.into(),
            id: None,
            registry,
            quit,
            pause_tx,
            resume_tx,
            workers: Some((pause_rx, resume_rx)),
        }
    }

    /// Publishes under `<key>/<id>` instead of `<key>/<lease-id>`, for
    /// deployments with stable instance ids.
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    /// Registers the key and spawns the renewal worker. The surrounding
    /// framework binds [`Publisher::stop`] to a shutdown wrap-up listener.
    pub async fn keep_alive(&mut self) -> Result<(), Error> {
        let client = self.registry.get_client(&self.endpoints).await?;
        let inner = Arc::new(Inner {
            key: self.key.clone(),
            value: self.value.clone(),
            id: self.id,
        });
        let (lease, acks) = inner.register(&client).await?;

        let (pause_rx, resume_rx) = self.workers.take().ok_or(Error::Closed)?;
        let quit = self.quit.subscribe();
        tokio::spawn(run(inner, client, lease, acks, quit, pause_rx, resume_rx));

        Ok(())
    }

    /// Revokes the lease and suspends renewal until [`Publisher::resume`].
    pub async fn pause(&self) {
        let _ = self.pause_tx.send(()).await;
    }

    pub async fn resume(&self) {
        let _ = self.resume_tx.send(()).await;
    }

    /// Revokes the lease and stops the renewal worker.
    pub fn stop(&self) {
        let _ = self.quit.send(true);
    }
}

impl Inner {
    fn full_key(&self, lease: i64) -> String {
        match self.id {
            Some(id) if id > 0 => format!("{}/{}", self.key, id),
            _ => format!("{}/{}", self.key, lease),
        }
    }

    async fn register(
        &self,
        client: &Arc<dyn KvClient>,
    ) -> Result<(i64, BoxStream<'static, ()>), Error> {
        let lease = client.grant(TIME_TO_LIVE).await?;
        client
            .put(&self.full_key(lease), &self.value, lease)
            .await?;
        let acks = client.keep_alive(lease).await?;

        Ok((lease, acks))
    }

    async fn revoke(&self, client: &Arc<dyn KvClient>, lease: i64) {
        if let Err(err) = client.revoke(lease).await {
            error!(message = "revoke lease failed", key = %self.key, error = %err);
        }
    }
}

async fn run(
    inner: Arc<Inner>,
    client: Arc<dyn KvClient>,
    mut lease: i64,
    mut acks: BoxStream<'static, ()>,
    mut quit: watch::Receiver<bool>,
    mut pause_rx: mpsc::Receiver<()>,
    mut resume_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = quit.changed() => {
                inner.revoke(&client, lease).await;
                return;
            }
            _ = pause_rx.recv() => {
                info!(message = "paused lease renewal", key = %inner.key, value = %inner.value);
                inner.revoke(&client, lease).await;
                tokio::select! {
                    _ = resume_rx.recv() => {
                        match recover(&inner, &client, &mut quit).await {
                            Some((fresh, fresh_acks)) => {
                                lease = fresh;
                                acks = fresh_acks;
                            }
                            None => return,
                        }
                    }
                    _ = quit.changed() => return,
                }
            }
            ack = acks.next() => {
                if ack.is_none() {
                    // the renewal stream died; the lease may lapse server
                    // side, so re-register from scratch
                    inner.revoke(&client, lease).await;
                    match recover(&inner, &client, &mut quit).await {
                        Some((fresh, fresh_acks)) => {
                            lease = fresh;
                            acks = fresh_acks;
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

/// Re-registers with a fixed retry cadence until it succeeds or the
/// publisher quits.
async fn recover(
    inner: &Arc<Inner>,
    client: &Arc<dyn KvClient>,
    quit: &mut watch::Receiver<bool>,
) -> Option<(i64, BoxStream<'static, ()>)> {
    loop {
        match inner.register(client).await {
            Ok(registered) => return Some(registered),
            Err(err) => {
                error!(message = "re-register failed", key = %inner.key, error = %err);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(RECOVER_INTERVAL) => {}
            _ = quit.changed() => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemFactory;
    use crate::{ClientFactory, Registry};

    struct SharedFactory(&'static MemFactory);

    #[async_trait::async_trait]
    impl ClientFactory for SharedFactory {
        async fn connect(&self, endpoints: &[String]) -> Result<Arc<dyn KvClient>, Error> {
            self.0.connect(endpoints).await
        }
    }

    fn leaked_registry() -> (&'static Registry, &'static MemFactory) {
        let factory: &'static MemFactory = Box::leak(Box::new(MemFactory::new()));
        let registry = Box::leak(Box::new(Registry::with_factory(Arc::new(SharedFactory(
            factory,
        )))));
        (registry, factory)
    }

    fn endpoints() -> Vec<String> {
        vec!["mem:2379".to_string()]
    }

    #[tokio::test(start_paused = true)]
    async fn register_publishes_under_the_lease() {
        let (registry, factory) = leaked_registry();
        let store = factory.client(&endpoints());

        let mut publisher =
            Publisher::with_registry(registry, endpoints(), "services/echo", "127.0.0.1:9000");
        publisher.keep_alive().await.unwrap();

        assert!(store.contains("services/echo/1"));
        assert_eq!(store.lease_count(), 1);

        publisher.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!store.contains("services/echo/1"));
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_id_shapes_the_key() {
        let (registry, factory) = leaked_registry();
        let store = factory.client(&endpoints());

        let mut publisher =
            Publisher::with_registry(registry, endpoints(), "services/echo", "127.0.0.1:9001")
                .with_id(42);
        publisher.keep_alive().await.unwrap();

        assert!(store.contains("services/echo/42"));
        publisher.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn pause_revokes_and_resume_republishes() {
        let (registry, factory) = leaked_registry();
        let store = factory.client(&endpoints());

        let mut publisher =
            Publisher::with_registry(registry, endpoints(), "services/echo", "127.0.0.1:9002")
                .with_id(7);
        publisher.keep_alive().await.unwrap();
        assert!(store.contains("services/echo/7"));

        publisher.pause().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!store.contains("services/echo/7"));

        publisher.resume().await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(store.contains("services/echo/7"));

        publisher.stop();
    }
}
