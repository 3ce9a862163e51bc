// mesh-core: the server mesh layer.
//
// Holds the authoritative fleet snapshot (center), the pending-request
// correlation table (request_cache), the persistent outbound links
// (communicator), the inbound mesh listener (mesh_server), and the
// discovery-driven resolver loop that keeps them in sync.

pub mod center;
pub mod communicator;
pub mod info;
pub mod mesh_server;
pub mod provider;
pub mod request_cache;
pub mod resolver;

pub use center::{SelectionPolicy, ServerChange, ServerInfoCenter};
pub use communicator::MeshCommunicator;
pub use info::{ServerInfo, ServerState, ServerType};
pub use mesh_server::{ClientSink, MeshNode, MeshServer, RouteHandler};
pub use provider::{FleetError, FleetFile, FleetProvider, StaticFleet};
pub use request_cache::{ReplyOutcome, ReplySlot, RequestCache};
pub use resolver::{AddressResolver, ServerListListener};
