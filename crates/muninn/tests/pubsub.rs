//! Pub/sub delivery: pull and callback modes, pattern and shard channels,
//! subscription lifecycle.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use muninn::{Client, Config, DecodeMode, ErrorKind, NodeAddr, PubsubConfig};
use muninn_testkit::{MockCluster, MockServer};
use parking_lot::Mutex;

fn base_config(server: &MockServer) -> Config {
    let mut config = Config::new(vec![NodeAddr::parse(&server.address()).unwrap()]);
    config.default_decoder = DecodeMode::Text;
    config
}

async fn subscriber(server: &MockServer, pubsub: PubsubConfig) -> Client {
    let mut config = base_config(server);
    config.pubsub = Some(pubsub);
    Client::connect(config).await.unwrap()
}

/// Publish until at least one subscriber receives the message.
async fn publish_until_received(publisher: &Client, channel: &str, payload: &str) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if publisher
                .publish(channel.to_string(), payload.to_string())
                .await
                .unwrap()
                >= 1
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscription should become visible");
}

#[tokio::test]
async fn pull_returns_published_message() {
    let server = MockServer::spawn().await;
    let client = subscriber(
        &server,
        PubsubConfig {
            channels: vec![Bytes::from_static(b"c")],
            ..PubsubConfig::default()
        },
    )
    .await;
    let publisher = Client::connect(base_config(&server)).await.unwrap();

    // The handshake-time SUBSCRIBE may still be in flight server-side.
    publish_until_received(&publisher, "c", "hello").await;

    let message = client.next_message().await.unwrap();
    assert_eq!(message.message, Bytes::from_static(b"hello"));
    assert_eq!(message.channel, Bytes::from_static(b"c"));
    assert_eq!(message.pattern, None);
}

#[tokio::test]
async fn pattern_subscriptions_carry_the_pattern() {
    let server = MockServer::spawn().await;
    let client = subscriber(
        &server,
        PubsubConfig {
            patterns: vec![Bytes::from_static(b"news.*")],
            ..PubsubConfig::default()
        },
    )
    .await;
    let publisher = Client::connect(base_config(&server)).await.unwrap();

    publish_until_received(&publisher, "news.sports", "goal").await;

    let message = client.next_message().await.unwrap();
    assert_eq!(message.channel, Bytes::from_static(b"news.sports"));
    assert_eq!(message.pattern, Some(Bytes::from_static(b"news.*")));
    assert_eq!(message.message, Bytes::from_static(b"goal"));
}

#[tokio::test]
async fn callback_mode_delivers_synchronously_and_disables_pull() {
    let server = MockServer::spawn().await;
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    let client = subscriber(
        &server,
        PubsubConfig {
            channels: vec![Bytes::from_static(b"c")],
            callback: Some(Arc::new(move |message| {
                sink.lock().push(message.message.clone());
            })),
            ..PubsubConfig::default()
        },
    )
    .await;
    let publisher = Client::connect(base_config(&server)).await.unwrap();

    publish_until_received(&publisher, "c", "one").await;
    publisher.publish("c", "two").await.unwrap();

    // Callback delivery happens on the read loop; give it a beat.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if received.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("callback should have fired twice");
    assert_eq!(
        received.lock().as_slice(),
        &[Bytes::from_static(b"one"), Bytes::from_static(b"two")]
    );

    // Pull is unavailable while the callback owns delivery.
    let err = client.try_next_message().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[tokio::test]
async fn try_next_message_does_not_block() {
    let server = MockServer::spawn().await;
    let client = subscriber(
        &server,
        PubsubConfig {
            channels: vec![Bytes::from_static(b"quiet")],
            ..PubsubConfig::default()
        },
    )
    .await;
    assert_eq!(client.try_next_message().unwrap(), None);
}

#[tokio::test]
async fn pull_without_configuration_fails() {
    let server = MockServer::spawn().await;
    let client = Client::connect(base_config(&server)).await.unwrap();
    let err = client.next_message().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[tokio::test]
async fn dynamic_subscribe_and_unsubscribe() {
    let server = MockServer::spawn().await;
    // Empty-but-present pub/sub config enables the pull queue.
    let client = subscriber(&server, PubsubConfig::default()).await;
    let publisher = Client::connect(base_config(&server)).await.unwrap();

    client.subscribe(["late"]).await.unwrap();
    // Wait until the server registered the subscription.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if publisher.publish("late", "ping").await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscription should become visible");
    let message = client.next_message().await.unwrap();
    assert_eq!(message.channel, Bytes::from_static(b"late"));

    client.unsubscribe(["late"]).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if publisher.publish("late", "gone").await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("unsubscribe should become visible");
}

#[tokio::test]
async fn pubsub_channels_lists_active_channels() {
    let server = MockServer::spawn().await;
    let client = subscriber(
        &server,
        PubsubConfig {
            channels: vec![Bytes::from_static(b"alpha"), Bytes::from_static(b"beta")],
            ..PubsubConfig::default()
        },
    )
    .await;

    let channels = client.pubsub_channels(None).await.unwrap();
    let mut names: Vec<String> = channels
        .iter()
        .filter_map(|value| value.as_text())
        .collect();
    names.sort();
    assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
}

#[tokio::test]
async fn shard_channels_route_to_the_owning_shard() {
    let cluster = MockCluster::spawn(3).await;
    let addresses: Vec<NodeAddr> = cluster
        .addrs()
        .iter()
        .map(|addr| NodeAddr::parse(addr).unwrap())
        .collect();

    let mut config = Config::new(addresses.clone());
    config.cluster_mode = true;
    config.topology_refresh_interval = None;
    config.pubsub = Some(PubsubConfig {
        shard_channels: vec![Bytes::from_static(b"shardy")],
        ..PubsubConfig::default()
    });
    let client = Client::connect(config).await.unwrap();

    let mut publisher_config = Config::new(addresses);
    publisher_config.cluster_mode = true;
    publisher_config.topology_refresh_interval = None;
    let publisher = Client::connect(publisher_config).await.unwrap();

    // SPUBLISH routes by the channel's slot, landing on the shard that
    // holds the subscription.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if publisher.spublish("shardy", "hi").await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("shard subscription should become visible");

    let message = client.next_message().await.unwrap();
    assert_eq!(message.channel, Bytes::from_static(b"shardy"));
    assert_eq!(message.message, Bytes::from_static(b"hi"));
    assert_eq!(message.pattern, None);
}
