//! Create+join round trip and reconnect, over a real TCP session.
//!
//! 1. A client connects, sends `JoinStage` for a stage that does not exist
//!    yet: the node creates it, runs the join, and answers on the same
//!    `msg_seq` with the server-chosen stage id.
//! 2. The client drops and rejoins with the same account: same actor
//!    instance, endpoint updated in place, `OnConnectionChanged(true)`.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;

use ph_protocol::{error_codes, system::StageRes};
use ph_test_utils::{PlayNodeHarness, RoomProbe, TestClient, TestFleet, counting_registry};

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn join_stage_round_trip_creates_stage_and_actor() {
    let fleet = TestFleet::new();
    let probe = Arc::new(RoomProbe::default());
    let node = PlayNodeHarness::start(
        "play-1",
        "p1",
        1,
        counting_registry(&probe),
        &fleet,
        Duration::from_secs(5),
    )
    .await;

    let mut client = TestClient::connect(node.tcp_addr).await.expect("connect");
    let reply = client.join_stage(1001, "room", b"user:u1").await.expect("join");

    assert_eq!(reply.error_code, error_codes::SUCCESS);
    assert_eq!(reply.stage_id, 1001);
    let res = StageRes::decode(&reply.payload).expect("payload");
    assert_eq!(res.stage_id, 1001);
    assert!(res.is_created);

    assert_eq!(probe.joins.load(Ordering::SeqCst), 1, "exactly one actor");
    assert!(node.dispatcher.has_stage(1001));
    assert_eq!(node.dispatcher.accounts().stage_of("u1"), Some(1001));

    // The joined session can talk to its stage.
    let echo = client.request("Echo", 1001, Bytes::from_static(b"hello")).await.expect("echo");
    assert_eq!(echo.error_code, error_codes::SUCCESS);
    assert_eq!(&echo.payload[..], b"hello");
}

#[tokio::test]
async fn reconnect_keeps_the_actor_and_updates_the_endpoint() {
    let fleet = TestFleet::new();
    let probe = Arc::new(RoomProbe::default());
    let node = PlayNodeHarness::start(
        "play-1",
        "p1",
        1,
        counting_registry(&probe),
        &fleet,
        Duration::from_secs(5),
    )
    .await;

    let mut client = TestClient::connect(node.tcp_addr).await.expect("connect");
    let reply = client.join_stage(1001, "room", b"user:u1").await.expect("join");
    assert!(StageRes::decode(&reply.payload).expect("payload").is_created);

    // The connection drops; the node notices and flags the actor offline.
    drop(client);
    wait_until("offline event", || {
        probe.conn_snapshot().contains(&("u1".to_owned(), false))
    })
    .await;

    // Same account, fresh connection: a reconnect, not a second actor.
    let mut client = TestClient::connect(node.tcp_addr).await.expect("reconnect");
    let reply = client.join_stage(1001, "room", b"user:u1").await.expect("rejoin");
    assert_eq!(reply.error_code, error_codes::SUCCESS);
    assert!(!StageRes::decode(&reply.payload).expect("payload").is_created);

    assert_eq!(probe.joins.load(Ordering::SeqCst), 1, "actor count unchanged");
    wait_until("online event", || {
        probe.conn_snapshot().contains(&("u1".to_owned(), true))
    })
    .await;

    // Pushes reach the new socket, proving the endpoint moved in place.
    let reply = client.request("PushMe", 1001, Bytes::new()).await.expect("push request");
    assert_eq!(reply.error_code, error_codes::SUCCESS);
    let push = client.recv_push(Duration::from_secs(5)).await.expect("push");
    assert_eq!(push.msg_id, "Pushed");
    assert_eq!(push.msg_seq, 0);
    assert_eq!(push.stage_id, 1001);
}
