use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::sync::OnceCell;

use crate::{ClientFactory, Error, Event, KvClient, UpdateListener, KV};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const COOL_DOWN: Duration = Duration::from_secs(1);

/// The state kept for one coordinator endpoint set: the connection, the
/// per-prefix views and the listeners fed by the watch tasks.
pub struct Cluster {
    endpoints: Vec<String>,
    values: Mutex<HashMap<String, HashMap<String, String>>>,
    listeners: Mutex<HashMap<String, Vec<Arc<dyn UpdateListener>>>>,
    client: OnceCell<Arc<dyn KvClient>>,
    factory: Arc<dyn ClientFactory>,
    done: watch::Sender<bool>,
}

impl Cluster {
    pub(crate) fn new(endpoints: Vec<String>, factory: Arc<dyn ClientFactory>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            endpoints,
            values: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            client: OnceCell::new(),
            factory,
            done,
        }
    }

    /// The shared coordinator client, connected on first use. Concurrent
    /// callers coalesce onto one connection attempt.
    pub(crate) async fn client(&self) -> Result<Arc<dyn KvClient>, Error> {
        self.client
            .get_or_try_init(|| self.factory.connect(&self.endpoints))
            .await
            .cloned()
    }

    /// The current in-memory view of `prefix`.
    pub(crate) fn current(&self, prefix: &str) -> Vec<KV> {
        let values = self.values.lock();
        values
            .get(prefix)
            .map(|kvs| {
                kvs.iter()
                    .map(|(k, v)| KV {
                        key: k.clone(),
                        value: v.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) async fn monitor(
        self: Arc<Self>,
        prefix: &str,
        listener: Arc<dyn UpdateListener>,
    ) -> Result<(), Error> {
        let start_watcher = {
            let mut listeners = self.listeners.lock();
            let entries = listeners.entry(prefix.to_string()).or_default();
            entries.push(listener);
            // the first listener for a prefix brings up its watch task
            entries.len() == 1
        };
        if !start_watcher {
            return Ok(());
        }

        let client = self.client().await?;
        let revision = self.load(&client, prefix).await?;

        let prefix = prefix.to_string();
        tokio::spawn(async move {
            self.watch_loop(client, prefix, revision).await;
        });

        Ok(())
    }

    /// Signals every watch task of this cluster to exit.
    pub(crate) fn stop(&self) {
        let _ = self.done.send(true);
    }

    /// Range-reads `prefix`, diffs it against the view and notifies the
    /// listeners; returns the revision of the snapshot. Retries with a
    /// fixed cool-down until it succeeds or the cluster shuts down.
    async fn load(&self, client: &Arc<dyn KvClient>, prefix: &str) -> Result<i64, Error> {
        let mut done = self.done.subscribe();

        loop {
            if *done.borrow() {
                return Err(Error::Closed);
            }

            let attempt = tokio::time::timeout(REQUEST_TIMEOUT, client.load(prefix));
            let err = tokio::select! {
                result = attempt => match result {
                    Ok(Ok((kvs, revision))) => {
                        self.handle_changes(prefix, kvs);
                        return Ok(revision);
                    }
                    Ok(Err(err)) => err,
                    Err(_) => Error::Timeout,
                },
                _ = done.changed() => return Err(Error::Closed),
            };

            error!(message = "load failed", prefix, error = %err);
            tokio::select! {
                _ = tokio::time::sleep(COOL_DOWN) => {}
                _ = done.changed() => return Err(Error::Closed),
            }
        }
    }

    async fn watch_loop(self: Arc<Self>, client: Arc<dyn KvClient>, prefix: String, revision: i64) {
        let mut done = self.done.subscribe();
        let mut revision = revision;

        loop {
            let mut stream = tokio::select! {
                result = client.watch(&prefix, revision + 1) => match result {
                    Ok(stream) => stream,
                    Err(err) => {
                        error!(message = "watch failed", prefix = %prefix, error = %err);
                        tokio::select! {
                            _ = tokio::time::sleep(COOL_DOWN) => continue,
                            _ = done.changed() => return,
                        }
                    }
                },
                _ = done.changed() => return,
            };

            loop {
                tokio::select! {
                    batch = stream.next() => match batch {
                        Some(events) => self.handle_events(&prefix, events),
                        None => break,
                    },
                    _ = done.changed() => return,
                }
            }

            // the stream restarted: re-list in full so anything missed
            // while the watch was down converges
            error!(message = "watch stream closed, reloading", prefix = %prefix);
            tokio::select! {
                _ = tokio::time::sleep(COOL_DOWN) => {}
                _ = done.changed() => return,
            }
            // load only gives up when the cluster shuts down
            match self.load(&client, &prefix).await {
                Ok(fresh) => revision = fresh,
                Err(_) => return,
            }
        }
    }

    /// Replaces the view of `prefix` with `kvs`, fanning the difference
    /// out to the listeners: adds first, then deletes.
    fn handle_changes(&self, prefix: &str, kvs: Vec<KV>) {
        let listeners = self.snapshot_listeners(prefix);

        let mut add = Vec::new();
        let mut remove = Vec::new();
        {
            let mut values = self.values.lock();
            let fresh: HashMap<String, String> =
                kvs.into_iter().map(|kv| (kv.key, kv.value)).collect();

            match values.get(prefix) {
                None => {
                    add = fresh
                        .iter()
                        .map(|(k, v)| KV {
                            key: k.clone(),
                            value: v.clone(),
                        })
                        .collect();
                }
                Some(old) => {
                    for (k, v) in old {
                        if fresh.get(k) != Some(v) {
                            remove.push(KV {
                                key: k.clone(),
                                value: v.clone(),
                            });
                        }
                    }
                    for (k, v) in &fresh {
                        if old.get(k) != Some(v) {
                            add.push(KV {
                                key: k.clone(),
                                value: v.clone(),
                            });
                        }
                    }
                }
            }
            values.insert(prefix.to_string(), fresh);
        }

        for kv in add {
            for listener in &listeners {
                listener.on_add(kv.clone());
            }
        }
        for kv in remove {
            for listener in &listeners {
                listener.on_delete(kv.clone());
            }
        }
    }

    /// Applies one watch batch to the view and notifies the listeners,
    /// adds before deletes.
    fn handle_events(&self, prefix: &str, events: Vec<Event>) {
        let listeners = self.snapshot_listeners(prefix);

        let mut added = Vec::new();
        let mut deleted = Vec::new();
        {
            let mut values = self.values.lock();
            let view = values.entry(prefix.to_string()).or_default();
            for event in events {
                match event {
                    Event::Put(kv) => {
                        view.insert(kv.key.clone(), kv.value.clone());
                        added.push(kv);
                    }
                    Event::Delete { key } => {
                        // deliver the value listeners saw on add, not the
                        // (empty) value of the delete event
                        let value = view.remove(&key).unwrap_or_default();
                        deleted.push(KV { key, value });
                    }
                }
            }
        }

        for kv in added {
            for listener in &listeners {
                listener.on_add(kv.clone());
            }
        }
        for kv in deleted {
            for listener in &listeners {
                listener.on_delete(kv.clone());
            }
        }
    }

    fn snapshot_listeners(&self, prefix: &str) -> Vec<Arc<dyn UpdateListener>> {
        self.listeners
            .lock()
            .get(prefix)
            .cloned()
            .unwrap_or_default()
    }
}
