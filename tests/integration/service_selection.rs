//! Weighted service selection across real API nodes.
//!
//! Two API nodes carry weights 3 and 1 in the same service id; a stage
//! fans requests at the service with the weighted policy and the empirical
//! answer distribution approaches 3:1.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};

use ph_protocol::error_codes;
use ph_test_utils::{
    ApiNodeHarness, PlayNodeHarness, RoomProbe, TestClient, TestFleet, WhoAmIHandler,
    counting_registry,
};
use stage_core::ApiHandler;

#[tokio::test]
async fn weighted_selection_approaches_the_configured_ratio() {
    let fleet = TestFleet::new();
    let probe = Arc::new(RoomProbe::default());
    let play = PlayNodeHarness::start(
        "play-1",
        "p1",
        1,
        counting_registry(&probe),
        &fleet,
        Duration::from_secs(10),
    )
    .await;
    let api_heavy = ApiNodeHarness::start(
        "api-1",
        "a1",
        5,
        3,
        vec![("WhoAmI", Arc::new(WhoAmIHandler { nid: "a1".to_owned() }) as Arc<dyn ApiHandler>)],
        &fleet,
    )
    .await;
    let api_light = ApiNodeHarness::start(
        "api-2",
        "a2",
        5,
        1,
        vec![("WhoAmI", Arc::new(WhoAmIHandler { nid: "a2".to_owned() }) as Arc<dyn ApiHandler>)],
        &fleet,
    )
    .await;

    // Everyone re-reads the fleet now that all three members exist.
    play.refresh().await;
    api_heavy.refresh().await;
    api_light.refresh().await;

    let mut client = TestClient::connect(play.tcp_addr).await.expect("connect");
    client.join_stage(1001, "room", b"user:u1").await.expect("join");

    let mut answers: HashMap<String, u32> = HashMap::new();
    let rounds = 120;
    for _ in 0..rounds {
        let mut payload = BytesMut::new();
        payload.put_u16_le(5);
        let reply = client.request("AskService", 1001, payload.freeze()).await.expect("ask");
        assert_eq!(reply.error_code, error_codes::SUCCESS);
        *answers.entry(String::from_utf8_lossy(&reply.payload).into_owned()).or_default() += 1;
    }

    let heavy = f64::from(*answers.get("a1").unwrap_or(&0));
    let light = f64::from(*answers.get("a2").unwrap_or(&0));
    assert_eq!(heavy + light, f64::from(rounds), "every request was answered");
    let share = heavy / f64::from(rounds);
    assert!(
        (0.60..=0.90).contains(&share),
        "3:1 weighting drifted: a1 answered {share:.2} of requests"
    );
    assert!(light > 0.0, "the light member still serves traffic");
}
