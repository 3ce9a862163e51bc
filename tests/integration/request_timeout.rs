//! Request timeouts, client-side and mesh-side.
//!
//! Client side: a connector-enforced deadline elapses while the stage
//! handler is still sleeping; the late real response is dropped and the
//! session keeps working. Mesh side: a stage-to-stage request against a
//! silent peer completes with `RequestTimeout` from the request cache
//! sweeper, and the waiter is claimed exactly once.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use ph_protocol::error_codes;
use ph_test_utils::{PlayNodeHarness, RoomProbe, TestClient, TestFleet, counting_registry};

#[tokio::test]
async fn client_deadline_elapses_and_the_late_response_is_dropped() {
    let fleet = TestFleet::new();
    let probe = Arc::new(RoomProbe::default());
    let node = PlayNodeHarness::start(
        "play-1",
        "p1",
        1,
        counting_registry(&probe),
        &fleet,
        Duration::from_secs(30),
    )
    .await;

    let mut client = TestClient::connect(node.tcp_addr).await.expect("connect");
    client.join_stage(1001, "room", b"user:u1").await.expect("join");

    // Handler sleeps 2 s; the client gives up after 1 s.
    let mut payload = BytesMut::new();
    payload.put_u64_le(2_000);
    let result = client
        .request_with_deadline("SlowMs", 1001, payload.freeze(), Duration::from_secs(1))
        .await;
    assert_eq!(result.expect_err("deadline must win").kind(), std::io::ErrorKind::TimedOut);

    // Wait out the handler, then prove the session still correlates
    // correctly: the stale SlowMs response never surfaces as an answer.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let echo = client.request("Echo", 1001, Bytes::from_static(b"still-alive")).await.expect("echo");
    assert_eq!(echo.error_code, error_codes::SUCCESS);
    assert_eq!(&echo.payload[..], b"still-alive");
}

#[tokio::test]
async fn mesh_request_to_a_silent_stage_times_out_via_the_cache() {
    let fleet = TestFleet::new();
    let probe1 = Arc::new(RoomProbe::default());
    let probe2 = Arc::new(RoomProbe::default());
    // Short node-level request timeout on the asking side.
    let asking = PlayNodeHarness::start(
        "play-1",
        "p1",
        1,
        counting_registry(&probe1),
        &fleet,
        Duration::from_millis(500),
    )
    .await;
    let silent = PlayNodeHarness::start(
        "play-7",
        "p7",
        1,
        counting_registry(&probe2),
        &fleet,
        Duration::from_secs(30),
    )
    .await;
    asking.refresh().await;
    silent.refresh().await;

    // Stand up the silent stage on play-7.
    let mut remote_client = TestClient::connect(silent.tcp_addr).await.expect("connect p7");
    remote_client.join_stage(2002, "room", b"user:r1").await.expect("join p7");

    let mut client = TestClient::connect(asking.tcp_addr).await.expect("connect p1");
    client.join_stage(1001, "room", b"user:u1").await.expect("join p1");

    // `Ignore` never answers; the sweeper must claim the pending entry.
    let reply = client
        .request("AskRemote", 1001, Bytes::from_static(b"p7|2002|Ignore"))
        .await
        .expect("relayed outcome");
    assert_eq!(reply.error_code, error_codes::REQUEST_TIMEOUT);
    assert_eq!(asking.cache.pending_count(), 0, "no entry leaked");
}
