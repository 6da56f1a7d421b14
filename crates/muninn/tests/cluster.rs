//! Cluster-mode behavior: slot routing, MOVED/ASK redirection, slot
//! agreement for transactions, and broadcast fan-out.

use muninn::{Client, Config, DecodeMode, ErrorKind, ExecResult, NodeAddr, Value};
use muninn_proto::hash_slot;
use muninn_testkit::MockCluster;

async fn cluster_client(cluster: &MockCluster) -> Client {
    let addresses = cluster
        .addrs()
        .iter()
        .map(|addr| NodeAddr::parse(addr).unwrap())
        .collect();
    let mut config = Config::new(addresses);
    config.cluster_mode = true;
    config.default_decoder = DecodeMode::Text;
    // Keep the suites deterministic: no surprise background refreshes.
    config.topology_refresh_interval = None;
    Client::connect(config).await.unwrap()
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

#[tokio::test]
async fn keyed_commands_land_on_the_owning_shard() {
    let cluster = MockCluster::spawn(3).await;
    let client = cluster_client(&cluster).await;

    client.set("k", "v").await.unwrap();
    assert_eq!(client.get("k").await.unwrap(), text("v"));

    let owner = cluster.owner_of_key(b"k");
    assert_eq!(cluster.servers[owner].key_count(), 1);
    for (index, server) in cluster.servers.iter().enumerate() {
        if index != owner {
            assert_eq!(server.key_count(), 0);
        }
    }
}

#[tokio::test]
async fn moved_redirection_is_transparent_and_updates_the_map() {
    let cluster = MockCluster::spawn(2).await;
    let client = cluster_client(&cluster).await;

    // Seed the client's slot map, then move the slot out from under it.
    let slot = hash_slot(b"k");
    let old_owner = cluster.owner_of(slot);
    let new_owner = (old_owner + 1) % 2;
    cluster.move_slot(slot, new_owner);

    // The stale map sends this to the old owner; the MOVED reply must be
    // consumed and the write retried at the new owner.
    client.set("k", "v").await.unwrap();
    assert_eq!(cluster.servers[new_owner].key_count(), 1);
    assert_eq!(cluster.servers[old_owner].key_count(), 0);

    // The follow-up read routes straight to the new owner.
    assert_eq!(client.get("k").await.unwrap(), text("v"));
}

#[tokio::test]
async fn ask_redirection_uses_an_asking_preamble() {
    let cluster = MockCluster::spawn(2).await;
    let client = cluster_client(&cluster).await;

    let slot = hash_slot(b"migrating");
    let owner = cluster.owner_of(slot);
    let target = (owner + 1) % 2;
    cluster.ask_slot(slot, target);

    client.set("migrating", "v").await.unwrap();
    // ASK is one-shot: the data lands on the target without a topology
    // change.
    assert_eq!(cluster.servers[target].key_count(), 1);
    cluster.clear_ask(slot);
}

#[tokio::test]
async fn cross_slot_transaction_fails_before_submission() {
    let cluster = MockCluster::spawn(3).await;
    let client = cluster_client(&cluster).await;

    // foo and bar hash to different slots.
    let mut tx = client.transaction();
    tx.set("foo", "1").set("bar", "2");
    let err = tx.exec().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cluster);

    // Nothing reached any node.
    for server in &cluster.servers {
        assert_eq!(server.key_count(), 0);
    }
}

#[tokio::test]
async fn hash_tags_make_transactions_single_slot() {
    let cluster = MockCluster::spawn(3).await;
    let client = cluster_client(&cluster).await;

    let mut tx = client.transaction();
    tx.set("{user}.a", "1").incr("{user}.a").get("{user}.b");
    match tx.exec().await.unwrap() {
        ExecResult::Replies(replies) => {
            assert_eq!(replies.len(), 3);
            assert_eq!(replies[1], Value::Integer(2));
        }
        ExecResult::Aborted => panic!("nothing was watched"),
    }
}

#[tokio::test]
async fn pipelines_fan_out_and_stitch_in_order() {
    let cluster = MockCluster::spawn(3).await;
    let client = cluster_client(&cluster).await;

    let mut pipeline = client.pipeline();
    pipeline
        .set("foo", "1")
        .set("bar", "2")
        .set("baz", "3")
        .get("foo")
        .get("bar")
        .get("baz");
    let replies = pipeline.execute().await.unwrap();
    assert_eq!(replies[3..], [text("1"), text("2"), text("3")]);
}

#[tokio::test]
async fn broadcast_aggregations() {
    let cluster = MockCluster::spawn(3).await;
    let client = cluster_client(&cluster).await;

    // Spread keys across shards.
    for key in ["foo", "bar", "baz", "qux"] {
        client.set(key, "x").await.unwrap();
    }

    client.ping_all().await.unwrap();
    assert_eq!(client.dbsize_total().await.unwrap(), 4);

    let mut keys = client.keys_all("*").await.unwrap();
    keys.sort_by_key(|value| value.as_text());
    assert_eq!(keys.len(), 4);
}

#[tokio::test]
async fn keyless_commands_reach_a_random_primary() {
    let cluster = MockCluster::spawn(3).await;
    let client = cluster_client(&cluster).await;
    // No key to hash; the router picks any primary and it answers.
    client.ping().await.unwrap();
}

#[tokio::test]
async fn broadcast_requires_cluster_mode() {
    let server = muninn_testkit::MockServer::spawn().await;
    let config = Config::new(vec![NodeAddr::parse(&server.address()).unwrap()]);
    let client = Client::connect(config).await.unwrap();

    let err = client.dbsize_total().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}
