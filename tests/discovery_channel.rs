//! Publisher -> registry -> channel, end to end over the in-memory
//! coordinator.

use std::sync::Arc;
use std::time::Duration;

use discovery::mem::MemFactory;
use discovery::{ClientFactory, Error, KvClient, Publisher, Registry};
use girder::client::{Channel, Connector};
use girder::status::{Code, Status};

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

struct LabelConnector;

impl Connector for LabelConnector {
    type Conn = String;

    fn connect(&self, addr: &str) -> String {
        format!("conn-{addr}")
    }
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn published_instances_reach_the_channel() {
    let (registry, _factory) = leaked_registry();

    let mut publisher = Publisher::with_registry(
        registry,
        endpoints(),
        "services/echo",
        "10.1.0.1:8080",
    )
    .with_id(1);
    publisher.keep_alive().await.unwrap();

    let channel = Channel::subscribe(registry, &endpoints(), "services/echo", LabelConnector)
        .await
        .unwrap();
    settle().await;
    assert_eq!(channel.addrs(), vec!["10.1.0.1:8080"]);

    let served = channel
        .call("ping", |conn| async move { Ok::<_, Status>(conn) })
        .await
        .unwrap();
    assert_eq!(served, "conn-10.1.0.1:8080");

    // a second instance comes up and joins the balancing set
    let mut second = Publisher::with_registry(
        registry,
        endpoints(),
        "services/echo",
        "10.1.0.2:8080",
    )
    .with_id(2);
    second.keep_alive().await.unwrap();
    settle().await;
    assert_eq!(
        channel.addrs(),
        vec!["10.1.0.1:8080", "10.1.0.2:8080"]
    );

    // the first instance deregisters; its conn leaves the set
    publisher.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    settle().await;
    assert_eq!(channel.addrs(), vec!["10.1.0.2:8080"]);

    second.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    settle().await;
    assert_eq!(channel.addrs(), Vec::<String>::new());

    let err = channel
        .call("ping", |conn| async move { Ok::<_, Status>(conn) })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
}
