//! Standalone-mode behavior against an in-process server: pipelining,
//! transactions, typed replies, and the documented edge cases.

use bytes::Bytes;
use muninn::{
    Client, Config, DecodeMode, ErrorKind, ExecResult, NodeAddr, SetCondition, Value, ZAddOptions,
    cmd::cmd,
};
use muninn_testkit::MockServer;

async fn text_client(server: &MockServer) -> Client {
    let mut config = Config::new(vec![NodeAddr::parse(&server.address()).unwrap()]);
    config.default_decoder = DecodeMode::Text;
    Client::connect(config).await.unwrap()
}

async fn bytes_client(server: &MockServer) -> Client {
    let config = Config::new(vec![NodeAddr::parse(&server.address()).unwrap()]);
    Client::connect(config).await.unwrap()
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

#[tokio::test]
async fn simple_pipeline_preserves_submission_order() {
    let server = MockServer::spawn().await;
    let client = text_client(&server).await;

    let mut pipeline = client.pipeline();
    pipeline
        .set("k1", "v1")
        .set("k2", "v2")
        .get("k1")
        .get("k2");
    let replies = pipeline.execute().await.unwrap();

    assert_eq!(
        replies,
        vec![
            Value::Simple("OK".into()),
            Value::Simple("OK".into()),
            text("v1"),
            text("v2"),
        ]
    );
}

#[tokio::test]
async fn atomic_transaction_success() {
    let server = MockServer::spawn().await;
    let client = text_client(&server).await;

    let mut tx = client.transaction();
    tx.set("a", "1").incr("a").get("a");
    let outcome = tx.exec().await.unwrap();

    assert_eq!(
        outcome,
        ExecResult::Replies(vec![
            Value::Simple("OK".into()),
            Value::Integer(2),
            text("2"),
        ])
    );
}

#[tokio::test]
async fn watched_key_mutation_aborts_the_transaction() {
    let server = MockServer::spawn().await;
    let client = text_client(&server).await;
    let other = text_client(&server).await;

    client.set("a", "initial").await.unwrap();
    client.watch(["a"]).await.unwrap();

    let mut tx = client.transaction();
    tx.set("a", "x");

    // An external writer invalidates the watch before EXEC.
    other.set("a", "mutated").await.unwrap();

    assert_eq!(tx.exec().await.unwrap(), ExecResult::Aborted);
    assert_eq!(client.get("a").await.unwrap(), text("mutated"));
}

#[tokio::test]
async fn unmolested_watch_commits() {
    let server = MockServer::spawn().await;
    let client = text_client(&server).await;

    client.set("balance", "10").await.unwrap();
    let mut tx = client.transaction();
    tx.watch(["balance"]).incr("balance");
    match tx.exec().await.unwrap() {
        ExecResult::Replies(replies) => assert_eq!(replies, vec![Value::Integer(11)]),
        ExecResult::Aborted => panic!("transaction should have committed"),
    }
}

#[tokio::test]
async fn queue_time_error_surfaces_as_exec_abort() {
    let server = MockServer::spawn().await;
    let client = text_client(&server).await;

    let mut tx = client.transaction();
    tx.set("a", "1");
    tx.add(cmd("DEFINITELYNOTACOMMAND").arg("x"));
    let err = tx.exec().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecAbort);
}

#[tokio::test]
async fn set_typed_response() {
    let server = MockServer::spawn().await;
    let client = text_client(&server).await;

    let added = client.sadd("s", ["a", "b", "a"]).await.unwrap();
    assert_eq!(added, 2);

    let members = client.smembers("s").await.unwrap();
    let Value::Set(members) = members else {
        panic!("SMEMBERS must decode as a set, got {members:?}");
    };
    assert_eq!(members.len(), 2);
    assert!(members.contains(&text("a")));
    assert!(members.contains(&text("b")));
}

#[tokio::test]
async fn string_round_trip_is_binary_safe() {
    let server = MockServer::spawn().await;
    let client = bytes_client(&server).await;

    let payload = Bytes::from_static(b"a\r\n\x00\xffb");
    client.set("bin", payload.clone()).await.unwrap();
    assert_eq!(client.get("bin").await.unwrap(), Value::Bytes(payload));
}

#[tokio::test]
async fn hash_round_trip_laws() {
    let server = MockServer::spawn().await;
    let client = text_client(&server).await;

    client.hset("h", [("f", "v")]).await.unwrap();
    assert_eq!(client.hget("h", "f").await.unwrap(), text("v"));
    assert!(client.hexists("h", "f").await.unwrap());

    assert_eq!(client.hdel("h", ["f"]).await.unwrap(), 1);
    assert!(!client.hexists("h", "f").await.unwrap());
}

#[tokio::test]
async fn sorted_set_round_trip_laws() {
    let server = MockServer::spawn().await;
    let client = text_client(&server).await;

    client
        .zadd("z", [(1.5, "m")], ZAddOptions::default())
        .await
        .unwrap();
    assert_eq!(client.zscore("z", "m").await.unwrap(), Some(1.5));
    assert_eq!(client.zscore("z", "absent").await.unwrap(), None);

    let members = client
        .zrange_by_score("z", f64::NEG_INFINITY, f64::INFINITY)
        .await
        .unwrap();
    assert!(members.contains(&text("m")));

    let by_index = client.zrange("z", 0, -1).await.unwrap();
    assert!(by_index.contains(&text("m")));
}

#[tokio::test]
async fn dump_restore_round_trip() {
    let server = MockServer::spawn().await;
    let client = text_client(&server).await;

    client.rpush("src", ["a", "b", "c"]).await.unwrap();
    let payload = client.dump("src").await.unwrap().expect("dump payload");
    client.restore("dst", 0, payload).await.unwrap();

    assert_eq!(
        client.lrange("dst", 0, -1).await.unwrap(),
        vec![text("a"), text("b"), text("c")]
    );
    assert_eq!(client.dump("missing").await.unwrap(), None);
}

#[tokio::test]
async fn get_on_unset_key_is_typed_null() {
    let server = MockServer::spawn().await;
    let client = text_client(&server).await;

    let value = client.get("never-set").await.unwrap();
    assert!(value.is_null());
    assert_ne!(value, text(""));
}

#[tokio::test]
async fn lrange_with_inverted_bounds_is_an_empty_list() {
    let server = MockServer::spawn().await;
    let client = text_client(&server).await;

    client.rpush("l", ["a", "b"]).await.unwrap();
    let values = client.lrange("l", 5, 2).await.unwrap();
    assert_eq!(values, Vec::<Value>::new());
}

#[tokio::test]
async fn zadd_nx_keeps_existing_scores_and_ch_counts_changes() {
    let server = MockServer::spawn().await;
    let client = text_client(&server).await;

    let options = ZAddOptions::default();
    assert_eq!(client.zadd("z", [(1.0, "m")], options).await.unwrap(), 1);

    // NX on an existing member: 0 added, score untouched.
    let nx = ZAddOptions {
        condition: SetCondition::IfAbsent,
        ..ZAddOptions::default()
    };
    assert_eq!(client.zadd("z", [(9.0, "m")], nx).await.unwrap(), 0);
    assert_eq!(client.zscore("z", "m").await.unwrap(), Some(1.0));

    // CH counts the score change.
    let ch = ZAddOptions {
        changed: true,
        ..ZAddOptions::default()
    };
    assert_eq!(client.zadd("z", [(3.0, "m")], ch).await.unwrap(), 1);
    assert_eq!(client.zadd("z", [(3.0, "m")], ch).await.unwrap(), 0);
}

#[tokio::test]
async fn command_errors_only_affect_their_own_entry() {
    let server = MockServer::spawn().await;
    let client = text_client(&server).await;

    client.set("str", "x").await.unwrap();

    let mut pipeline = client.pipeline();
    pipeline.set("ok1", "1");
    pipeline.add(cmd("LPUSH").key("str").arg("boom"));
    pipeline.get("ok1");
    let results = pipeline.try_execute().await.unwrap();

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    let err = results[1].as_ref().unwrap_err();
    assert_eq!(
        err.kind(),
        ErrorKind::Server(muninn::ServerErrorKind::WrongType)
    );
    assert_eq!(results[2].as_ref().unwrap(), &text("1"));
}

#[tokio::test]
async fn incr_decr_and_counters() {
    let server = MockServer::spawn().await;
    let client = text_client(&server).await;

    assert_eq!(client.incr("n").await.unwrap(), 1);
    assert_eq!(client.incr_by("n", 10).await.unwrap(), 11);
    assert_eq!(client.decr("n").await.unwrap(), 10);
    assert_eq!(client.strlen("n").await.unwrap(), 2);
}

#[tokio::test]
async fn mget_reports_missing_keys_as_null() {
    let server = MockServer::spawn().await;
    let client = text_client(&server).await;

    client.mset([("a", "1"), ("b", "2")]).await.unwrap();
    let values = client.mget(["a", "missing", "b"]).await.unwrap();
    assert_eq!(values, vec![text("1"), Value::Null, text("2")]);
}
