// playhouse: facade over the core crates.
//
// The workspace members hold the actual implementations; this package
// re-exports them under stable names and hosts the end-to-end suites in
// tests/integration/.

pub use mesh_core as mesh;
pub use ph_protocol as protocol;
pub use ph_transport as transport;
pub use stage_core as stage;
