use std::sync::Arc;
use std::time::Duration;

use plexus_broker::{Broker, BrokerClient, BrokerOptions, BrokerServer, ClientOptions};
use plexus_protocol::{DeltaOp, ErrorCode, SubscribeRequest};
use plexus_query::{BusList, Plan, ReplaySource};
use plexus_records::QueryParams;
use serde_json::json;

async fn start() -> (String, tokio_util::sync::CancellationToken) {
    let broker = Arc::new(Broker::new(BrokerOptions::default()));
    let server = BrokerServer::bind(broker, "127.0.0.1:0").await.expect("bind");
    let addr = server.local_addr().expect("addr").to_string();
    let cancel = server.cancel_token();
    tokio::spawn(server.run());
    (addr, cancel)
}

async fn client(addr: &str) -> BrokerClient {
    BrokerClient::connect(
        addr,
        ClientOptions {
            request_timeout: Duration::from_secs(2),
            from_plugin: Some("tester".into()),
            ..ClientOptions::default()
        },
    )
    .await
    .expect("connect")
}

#[tokio::test]
async fn publish_then_get_recent_over_tcp() {
    let (addr, cancel) = start().await;
    let client = client(&addr).await;
    client
        .publish("messages", "chat", json!({"message_id": "m1", "content": "hello"}))
        .await
        .expect("publish");
    let recent = client
        .get_recent("messages", "chat", 1)
        .await
        .expect("recent");
    assert_eq!(recent, vec![json!({"message_id": "m1", "content": "hello"})]);

    let err = client
        .request("bus.nope", json!({}))
        .await
        .expect_err("unknown op");
    let info: plexus_protocol::ErrorInfo = err.into();
    assert_eq!(info.code, ErrorCode::UnknownOp);
    cancel.cancel();
}

#[tokio::test]
async fn subscriptions_push_delta_batches() {
    let (addr, cancel) = start().await;
    let watcher = client(&addr).await;
    let publisher = client(&addr).await;
    let mut deltas = watcher.deltas();
    let ack = watcher
        .subscribe(&SubscribeRequest::new("messages"))
        .await
        .expect("subscribe");
    assert_eq!(ack.rev, 0);

    publisher
        .publish("messages", "chat", json!({"message_id": "m2"}))
        .await
        .expect("publish");
    let batch = tokio::time::timeout(Duration::from_secs(2), deltas.recv())
        .await
        .expect("batch in time")
        .expect("batch");
    assert_eq!(batch.kind, "delta_batch");
    assert_eq!(batch.from, "tester");
    assert_eq!(batch.items[0].op, DeltaOp::Add);
    assert_eq!(batch.items[0].rev, 1);

    assert!(watcher.unsubscribe(&ack.sub_id).await.expect("unsubscribe"));
    cancel.cancel();
}

#[tokio::test]
async fn client_replay_matches_local_evaluation() {
    let (addr, cancel) = start().await;
    let client = client(&addr).await;
    for (id, priority) in [("a", 4), ("b", 1), ("c", 9)] {
        client
            .publish("messages", "chat", json!({"message_id": id, "priority": priority}))
            .await
            .expect("publish");
    }
    let base = BusList::evaluate(&Plan::get("messages", QueryParams::default()), &client)
        .await
        .expect("fetch");
    let view = base.where_ne("message_id", "b").sort(&["priority"], true);
    let plan = view.plan().expect("plan").clone();

    let remote = client.replay(&plan).await.expect("remote replay");
    assert_eq!(remote, view);
    assert_eq!(remote.keys(), vec!["message:c", "message:a"]);
    assert!(!remote.trace().is_empty());

    // an in-process predicate forces local evaluation through fetch
    let local = base.where_fn("odd priority", |r| r.priority() % 2 == 1);
    let again = client
        .replay(local.plan().expect("plan"))
        .await
        .expect("local replay");
    assert_eq!(again.keys(), vec!["message:b", "message:c"]);
    cancel.cancel();
}
