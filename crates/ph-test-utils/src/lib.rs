// ph-test-utils: shared harness for the end-to-end suites.
//
// Spins up complete in-process nodes (play and API) on random ports, wired
// through a shared scripted fleet, plus a wire-level client that speaks the
// binary protocol like an external connector would. Each test builds its
// own isolated cluster.

pub mod content;
pub mod harness;
pub mod test_client;

pub use content::{CountingPlayer, CountingRoom, RoomProbe, WhoAmIHandler, counting_registry};
pub use harness::{ApiNodeHarness, PlayNodeHarness, TestFleet};
pub use test_client::TestClient;
