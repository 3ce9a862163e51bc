//! Discovery-driven link drop.
//!
//! A request is in flight to a peer when discovery removes that peer: the
//! communicator disconnects, and every outstanding request bound to the
//! lost target completes with `ConnectionClosed`. Later sends toward the
//! vanished peer fail fast.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use ph_protocol::error_codes;
use ph_test_utils::{PlayNodeHarness, RoomProbe, TestClient, TestFleet, counting_registry};

#[tokio::test]
async fn removal_of_the_target_completes_outstanding_requests() {
    let fleet = TestFleet::new();
    let probe1 = Arc::new(RoomProbe::default());
    let probe7 = Arc::new(RoomProbe::default());
    let play1 = PlayNodeHarness::start(
        "play-1",
        "p1",
        1,
        counting_registry(&probe1),
        &fleet,
        Duration::from_secs(30),
    )
    .await;
    let play7 = PlayNodeHarness::start(
        "play-7",
        "p7",
        1,
        counting_registry(&probe7),
        &fleet,
        Duration::from_secs(30),
    )
    .await;
    play1.refresh().await;
    play7.refresh().await;

    // A stage on play-7 that will never answer.
    let mut remote_client = TestClient::connect(play7.tcp_addr).await.expect("connect p7");
    remote_client.join_stage(2002, "room", b"user:r1").await.expect("join p7");

    let mut client = TestClient::connect(play1.tcp_addr).await.expect("connect p1");
    client.join_stage(1001, "room", b"user:u1").await.expect("join p1");

    // Baseline: the mesh link answers while play-7 is alive.
    let reply = client
        .request("AskRemote", 1001, Bytes::from_static(b"p7|2002|Echo"))
        .await
        .expect("baseline round trip");
    assert_eq!(reply.error_code, error_codes::SUCCESS);

    // Fire the relayed request on its own task; it stays pending on play-1.
    let pending = tokio::spawn(async move {
        let reply = client
            .request("AskRemote", 1001, Bytes::from_static(b"p7|2002|Ignore"))
            .await
            .expect("relayed outcome");
        (client, reply)
    });
    for _ in 0..100 {
        if play1.cache.pending_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(play1.cache.pending_count(), 1, "request is in flight");

    // Discovery drops play-7; the next cycle tears the link down.
    fleet.remove("play-7");
    play1.refresh().await;

    let (mut client, reply) =
        tokio::time::timeout(Duration::from_secs(5), pending).await.expect("completed").expect("join");
    assert_eq!(reply.error_code, error_codes::CONNECTION_CLOSED);
    assert_eq!(play1.cache.pending_count(), 0);
    assert!(!play1.communicator.is_connected("play-7"));

    // The peer is gone from the snapshot: later requests fail fast.
    let reply = client
        .request("AskRemote", 1001, Bytes::from_static(b"p7|2002|Ignore"))
        .await
        .expect("fast failure");
    assert_eq!(reply.error_code, error_codes::CONNECTION_CLOSED);
}
