//! Per-stage ordering under concurrent producers, over real sockets.
//!
//! Three clients race pushes onto one stage. The stage must observe each
//! client's messages in that client's send order (per-session FIFO into
//! per-stage FIFO); cross-client interleaving is unconstrained.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use ph_test_utils::{PlayNodeHarness, RoomProbe, TestClient, TestFleet, counting_registry};

const PER_PRODUCER: usize = 40;

#[tokio::test]
async fn producers_racing_one_stage_keep_their_enqueue_order() {
    let fleet = TestFleet::new();
    let probe = Arc::new(RoomProbe::default());
    let node = PlayNodeHarness::start(
        "play-1",
        "p1",
        1,
        counting_registry(&probe),
        &fleet,
        Duration::from_secs(10),
    )
    .await;

    let mut producers = Vec::new();
    for id in 0..3 {
        let mut client = TestClient::connect(node.tcp_addr).await.expect("connect");
        client
            .join_stage(1001, "room", format!("user:u{id}").as_bytes())
            .await
            .expect("join");
        producers.push(tokio::spawn(async move {
            for seq in 0..PER_PRODUCER {
                client
                    .push("Append", 1001, Bytes::from(format!("{id}-{seq}").into_bytes()))
                    .await
                    .expect("push");
            }
            // Barrier: a request whose response proves all pushes from this
            // session were dispatched (per-session FIFO).
            client.request("Echo", 1001, Bytes::new()).await.expect("barrier");
        }));
    }
    for producer in producers {
        producer.await.expect("producer");
    }

    let log = probe.log_snapshot();
    assert_eq!(log.len(), 3 * PER_PRODUCER, "no message lost or duplicated");
    for id in 0..3 {
        let seqs: Vec<usize> = log
            .iter()
            .filter_map(|line| line.strip_prefix(&format!("{id}-")).map(|s| s.parse().expect("seq")))
            .collect();
        assert_eq!(
            seqs,
            (0..PER_PRODUCER).collect::<Vec<_>>(),
            "producer {id} messages reordered"
        );
    }
}
