//! An in-memory coordinator for tests: same contract as etcd, driven
//! synchronously from the test body.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{ClientFactory, Error, Event, KvClient, KV};

#[derive(Default)]
struct MemState {
    data: BTreeMap<String, String>,
    revision: i64,
    next_lease: i64,
    leases: HashMap<i64, Vec<String>>,
    watchers: Vec<Watcher>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Vec<Event>>,
}

/// A fake coordinator holding its whole store in memory.
#[derive(Clone, Default)]
pub struct MemClient {
    state: Arc<Mutex<MemState>>,
}

impl MemClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `key` and fans the change out to matching watchers.
    pub fn insert(&self, key: &str, value: &str) {
        let mut state = self.state.lock();
        state.revision += 1;
        state.data.insert(key.to_string(), value.to_string());
        notify(
            &mut state,
            Event::Put(KV {
                key: key.to_string(),
                value: value.to_string(),
            }),
        );
    }

    /// Deletes `key` and fans the change out to matching watchers.
    pub fn remove(&self, key: &str) {
        let mut state = self.state.lock();
        if state.data.remove(key).is_none() {
            return;
        }
        state.revision += 1;
        notify(
            &mut state,
            Event::Delete {
                key: key.to_string(),
            },
        );
    }

    /// Ends every watch stream, as a network partition would. Watchers
    /// re-list once they reconnect.
    pub fn disconnect_watchers(&self) {
        self.state.lock().watchers.clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().data.contains_key(key)
    }

    pub fn lease_count(&self) -> usize {
        self.state.lock().leases.len()
    }
}

fn notify(state: &mut MemState, event: Event) {
    let key = match &event {
        Event::Put(kv) => &kv.key,
        Event::Delete { key } => key,
    };
    state
        .watchers
        .retain(|w| !key.starts_with(&w.prefix) || w.tx.send(vec![event.clone()]).is_ok());
}

#[async_trait]
impl KvClient for MemClient {
    async fn load(&self, prefix: &str) -> Result<(Vec<KV>, i64), Error> {
        let state = self.state.lock();
        let kvs = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KV {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();

        Ok((kvs, state.revision))
    }

    async fn watch(
        &self,
        prefix: &str,
        _revision: i64,
    ) -> Result<BoxStream<'static, Vec<Event>>, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn grant(&self, _ttl_seconds: i64) -> Result<i64, Error> {
        let mut state = self.state.lock();
        state.next_lease += 1;
        let lease = state.next_lease;
        state.leases.insert(lease, Vec::new());

        Ok(lease)
    }

    async fn put(&self, key: &str, value: &str, lease: i64) -> Result<(), Error> {
        self.insert(key, value);
        if lease != 0 {
            let mut state = self.state.lock();
            if let Some(keys) = state.leases.get_mut(&lease) {
                keys.push(key.to_string());
            }
        }

        Ok(())
    }

    async fn keep_alive(&self, _lease: i64) -> Result<BoxStream<'static, ()>, Error> {
        // renews forever; tests cut it by dropping the publisher or quitting
        let stream = futures::stream::unfold((), |()| async {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            Some(((), ()))
        });

        Ok(stream.boxed())
    }

    async fn revoke(&self, lease: i64) -> Result<(), Error> {
        let keys = self.state.lock().leases.remove(&lease).unwrap_or_default();
        for key in keys {
            self.remove(&key);
        }

        Ok(())
    }
}

/// Hands out one shared [`MemClient`] per endpoint set.
#[derive(Default)]
pub struct MemFactory {
    clients: Mutex<HashMap<String, MemClient>>,
}

impl MemFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The client the factory serves for `endpoints`, creating it if
    /// needed; lets tests seed data before any cluster connects.
    pub fn client(&self, endpoints: &[String]) -> MemClient {
        let key = endpoints.join(",");
        self.clients.lock().entry(key).or_default().clone()
    }
}

#[async_trait]
impl ClientFactory for MemFactory {
    async fn connect(&self, endpoints: &[String]) -> Result<Arc<dyn KvClient>, Error> {
        Ok(Arc::new(self.client(endpoints)))
    }
}
