//! Service discovery over a remote KV coordinator (etcd in production).
//!
//! A process-wide [`Registry`] deduplicates coordinator connections per
//! endpoint set and maintains, per watched key prefix, an in-memory view
//! that is replayed to new listeners and kept fresh by a watch stream.
//! Whenever the stream restarts the prefix is re-listed in full, so missed
//! events converge; the model is eventual and monotonic per prefix.

#[macro_use]
extern crate tracing;

mod cluster;
mod etcd;
pub mod mem;
mod publisher;

pub use cluster::Cluster;
pub use etcd::EtcdClient;
pub use publisher::Publisher;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("etcd: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("discovery is shutting down")]
    Closed,
    #[error("coordinator request timed out")]
    Timeout,
}

/// One key/value pair under a watched prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KV {
    pub key: String,
    pub value: String,
}

/// A change observed on the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Put(KV),
    Delete { key: String },
}

/// Receives view changes for a watched prefix. Callbacks run outside the
/// cluster lock and must not block for long.
pub trait UpdateListener: Send + Sync {
    fn on_add(&self, kv: KV);
    fn on_delete(&self, kv: KV);
}

/// The narrow coordinator surface the registry needs. Production uses
/// [`EtcdClient`]; tests substitute [`mem::MemClient`].
#[async_trait]
pub trait KvClient: Send + Sync + 'static {
    /// Range-reads every key under `prefix`; returns the pairs and the
    /// store revision of the snapshot.
    async fn load(&self, prefix: &str) -> Result<(Vec<KV>, i64), Error>;

    /// Streams change batches for `prefix`, starting at `revision`. The
    /// stream ends when the underlying watch dies; the caller re-lists and
    /// re-watches.
    async fn watch(
        &self,
        prefix: &str,
        revision: i64,
    ) -> Result<BoxStream<'static, Vec<Event>>, Error>;

    async fn grant(&self, ttl_seconds: i64) -> Result<i64, Error>;

    async fn put(&self, key: &str, value: &str, lease: i64) -> Result<(), Error>;

    /// Keeps `lease` alive; the stream yields one item per acknowledged
    /// renewal and ends when the lease cannot be renewed any more.
    async fn keep_alive(&self, lease: i64) -> Result<BoxStream<'static, ()>, Error>;

    async fn revoke(&self, lease: i64) -> Result<(), Error>;
}

/// Builds coordinator clients; one exists per registry so tests can wire
/// in fakes.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, endpoints: &[String]) -> Result<Arc<dyn KvClient>, Error>;
}

struct EtcdFactory;

#[async_trait]
impl ClientFactory for EtcdFactory {
    async fn connect(&self, endpoints: &[String]) -> Result<Arc<dyn KvClient>, Error> {
        Ok(Arc::new(EtcdClient::connect(endpoints).await?))
    }
}

/// Deduplicates clusters (and with them coordinator connections) by their
/// sorted endpoint list.
pub struct Registry {
    clusters: Mutex<HashMap<String, Arc<Cluster>>>,
    factory: Arc<dyn ClientFactory>,
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

impl Registry {
    /// The process-wide registry backed by etcd.
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(|| Registry::with_factory(Arc::new(EtcdFactory)))
    }

    pub fn with_factory(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            clusters: Mutex::new(HashMap::new()),
            factory,
        }
    }

    /// Watches `prefix` on the cluster at `endpoints`. If the cluster is
    /// already resident its current view is replayed to `listener`
    /// synchronously before the subscription starts.
    pub async fn monitor(
        &self,
        endpoints: &[String],
        prefix: &str,
        listener: Arc<dyn UpdateListener>,
    ) -> Result<(), Error> {
        let (cluster, existed) = self.get_cluster(endpoints);
        if existed {
            for kv in cluster.current(prefix) {
                listener.on_add(kv);
            }
        }

        cluster.monitor(prefix, listener).await
    }

    /// The shared coordinator client for `endpoints`, connecting on first
    /// use.
    pub async fn get_client(&self, endpoints: &[String]) -> Result<Arc<dyn KvClient>, Error> {
        let (cluster, _) = self.get_cluster(endpoints);
        cluster.client().await
    }

    /// Stops every cluster's watchers. Bound to the process shutdown
    /// listeners by the surrounding framework.
    pub fn shutdown(&self) {
        for cluster in self.clusters.lock().values() {
            cluster.stop();
        }
    }

    fn get_cluster(&self, endpoints: &[String]) -> (Arc<Cluster>, bool) {
        let key = cluster_key(endpoints);
        let mut clusters = self.clusters.lock();
        match clusters.get(&key) {
            Some(cluster) => (Arc::clone(cluster), true),
            None => {
                let cluster = Arc::new(Cluster::new(
                    endpoints.to_vec(),
                    Arc::clone(&self.factory),
                ));
                clusters.insert(key, Arc::clone(&cluster));
                (cluster, false)
            }
        }
    }
}

fn cluster_key(endpoints: &[String]) -> String {
    let mut sorted = endpoints.to_vec();
    sorted.sort();
    sorted.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemFactory;
    use std::time::Duration;

    #[test]
    fn cluster_key_is_order_insensitive() {
        let a = cluster_key(&["b:2379".to_string(), "a:2379".to_string()]);
        let b = cluster_key(&["a:2379".to_string(), "b:2379".to_string()]);
        assert_eq!(a, b);
        assert_eq!(a, "a:2379,b:2379");
    }

    struct Recorder {
        events: Mutex<Vec<(String, KV)>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<(String, KV)> {
            std::mem::take(&mut self.events.lock())
        }
    }

    impl UpdateListener for Recorder {
        fn on_add(&self, kv: KV) {
            self.events.lock().push(("add".to_string(), kv));
        }

        fn on_delete(&self, kv: KV) {
            self.events.lock().push(("del".to_string(), kv));
        }
    }

    fn endpoints() -> Vec<String> {
        vec!["mem:2379".to_string()]
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_lists_then_streams_changes() {
        let factory = Arc::new(MemFactory::new());
        let store = factory.client(&endpoints());
        store.insert("svc/x", "1");
        store.insert("svc/y", "2");
        let registry = Registry::with_factory(factory);

        let listener = Recorder::new();
        registry
            .monitor(&endpoints(), "svc", listener.clone())
            .await
            .unwrap();

        // the initial list is delivered before monitor returns
        let mut initial = listener.take();
        initial.sort_by(|a, b| a.1.key.cmp(&b.1.key));
        assert_eq!(initial.len(), 2);
        assert_eq!(initial[0].0, "add");
        assert_eq!(initial[0].1.key, "svc/x");
        assert_eq!(initial[1].1.key, "svc/y");

        store.insert("svc/z", "3");
        settle().await;
        assert_eq!(
            listener.take(),
            vec![(
                "add".to_string(),
                KV {
                    key: "svc/z".to_string(),
                    value: "3".to_string()
                }
            )]
        );

        store.remove("svc/x");
        settle().await;
        assert_eq!(
            listener.take(),
            vec![(
                "del".to_string(),
                KV {
                    key: "svc/x".to_string(),
                    value: "1".to_string()
                }
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_listener_gets_a_synchronous_replay() {
        let factory = Arc::new(MemFactory::new());
        let store = factory.client(&endpoints());
        store.insert("svc/x", "1");
        let registry = Registry::with_factory(factory);

        let first = Recorder::new();
        registry
            .monitor(&endpoints(), "svc", first.clone())
            .await
            .unwrap();
        store.insert("svc/y", "2");
        settle().await;

        let second = Recorder::new();
        registry
            .monitor(&endpoints(), "svc", second.clone())
            .await
            .unwrap();

        let mut replay = second.take();
        replay.sort_by(|a, b| a.1.key.cmp(&b.1.key));
        assert_eq!(replay.len(), 2);
        assert!(replay.iter().all(|(op, _)| op == "add"));

        // both listeners ride the same watch stream from here
        store.insert("svc/z", "3");
        settle().await;
        assert_eq!(first.take().len(), 2 + 1);
        assert_eq!(second.take().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_restart_relists_missed_changes() {
        let factory = Arc::new(MemFactory::new());
        let store = factory.client(&endpoints());
        store.insert("svc/a", "1");
        let registry = Registry::with_factory(factory);

        let listener = Recorder::new();
        registry
            .monitor(&endpoints(), "svc", listener.clone())
            .await
            .unwrap();
        listener.take();

        // partition: the watch stream dies and changes go unseen
        store.disconnect_watchers();
        store.insert("svc/b", "2");

        // after the cool-down the cluster re-lists and re-watches
        tokio::time::sleep(Duration::from_millis(1500)).await;
        settle().await;
        assert_eq!(
            listener.take(),
            vec![(
                "add".to_string(),
                KV {
                    key: "svc/b".to_string(),
                    value: "2".to_string()
                }
            )]
        );

        store.insert("svc/c", "3");
        settle().await;
        assert_eq!(listener.take().len(), 1);
    }
}
