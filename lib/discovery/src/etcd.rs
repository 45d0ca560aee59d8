use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions,
};
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::{Error, Event, KvClient, KV};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// The production coordinator client.
pub struct EtcdClient {
    client: Client,
}

impl EtcdClient {
    pub async fn connect(endpoints: &[String]) -> Result<Self, Error> {
        let options = ConnectOptions::new()
            .with_connect_timeout(DIAL_TIMEOUT)
            .with_keep_alive(DIAL_TIMEOUT, DIAL_TIMEOUT);
        let client = Client::connect(endpoints, Some(options)).await?;

        Ok(Self { client })
    }
}

#[async_trait]
impl KvClient for EtcdClient {
    async fn load(&self, prefix: &str) -> Result<(Vec<KV>, i64), Error> {
        let mut client = self.client.kv_client();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        let mut kvs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            kvs.push(KV {
                key: kv.key_str()?.to_string(),
                value: kv.value_str()?.to_string(),
            });
        }

        Ok((kvs, revision))
    }

    async fn watch(
        &self,
        prefix: &str,
        revision: i64,
    ) -> Result<BoxStream<'static, Vec<Event>>, Error> {
        let mut client = self.client.watch_client();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(revision);
        let (watcher, stream) = client.watch(prefix, Some(options)).await?;

        // the watcher handle rides along in the stream state; dropping it
        // cancels the server-side watch
        let stream = futures::stream::unfold((watcher, stream), |(watcher, mut stream)| async {
            match stream.message().await {
                Ok(Some(resp)) => {
                    if resp.canceled() {
                        warn!(message = "watch canceled by server");
                        return None;
                    }

                    let mut events = Vec::with_capacity(resp.events().len());
                    for event in resp.events() {
                        let Some(kv) = event.kv() else {
                            continue;
                        };
                        let key = match kv.key_str() {
                            Ok(key) => key.to_string(),
                            Err(err) => {
                                warn!(message = "skipping non-utf8 key", error = %err);
                                continue;
                            }
                        };
                        match event.event_type() {
                            EventType::Put => {
                                let value = kv.value_str().unwrap_or_default().to_string();
                                events.push(Event::Put(KV { key, value }));
                            }
                            EventType::Delete => events.push(Event::Delete { key }),
                        }
                    }

                    Some((events, (watcher, stream)))
                }
                Ok(None) => None,
                Err(err) => {
                    error!(message = "watch stream error", error = %err);
                    None
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn grant(&self, ttl_seconds: i64) -> Result<i64, Error> {
        let mut client = self.client.lease_client();
        let resp = client.grant(ttl_seconds, None).await?;

        Ok(resp.id())
    }

    async fn put(&self, key: &str, value: &str, lease: i64) -> Result<(), Error> {
        let mut client = self.client.kv_client();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease)))
            .await?;

        Ok(())
    }

    async fn keep_alive(&self, lease: i64) -> Result<BoxStream<'static, ()>, Error> {
        let mut client = self.client.lease_client();
        let (keeper, stream) = client.keep_alive(lease).await?;

        // drive one renewal per interval; the stream ends as soon as a
        // renewal fails or the server reports the lease gone (ttl 0)
        let stream = futures::stream::unfold(
            (keeper, stream),
            |(mut keeper, mut stream)| async move {
                tokio::time::sleep(KEEP_ALIVE_INTERVAL).await;
                if let Err(err) = keeper.keep_alive().await {
                    error!(message = "lease renewal failed", error = %err);
                    return None;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => Some(((), (keeper, stream))),
                    Ok(_) => None,
                    Err(err) => {
                        error!(message = "lease stream error", error = %err);
                        None
                    }
                }
            },
        );

        Ok(stream.boxed())
    }

    async fn revoke(&self, lease: i64) -> Result<(), Error> {
        let mut client = self.client.lease_client();
        client.revoke(lease).await?;

        Ok(())
    }
}
