//! In-process node harnesses.
//!
//! Each harness owns a complete node on random loopback ports: center,
//! request cache (+ sweeper), communicator, mesh listener, resolver, and —
//! for play nodes — the session transport. Nodes of one test share a
//! `TestFleet`; discovery is stepped explicitly with `refresh()` so tests
//! stay deterministic.

use std::sync::Arc;
use std::time::Duration;

use mesh_core::{
    AddressResolver, FleetProvider, MeshCommunicator, MeshNode, MeshServer, RequestCache,
    ServerInfo, ServerInfoCenter, ServerListListener, ServerState, ServerType, StaticFleet,
};
use ph_transport::{SessionRegistry, SessionServer, TransportConfig};
use stage_core::{
    ApiDispatcher, ApiHandler, ContentRegistry, NodeContext, PlayDispatcher, SessionSink,
};

// ---------------------------------------------------------------------------
// TestFleet
// ---------------------------------------------------------------------------

/// The scripted discovery source shared by every node in a test cluster.
#[derive(Default)]
pub struct TestFleet {
    fleet: Arc<StaticFleet>,
    members: std::sync::Mutex<Vec<ServerInfo>>,
}

impl TestFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn provider(&self) -> Arc<StaticFleet> {
        Arc::clone(&self.fleet)
    }

    /// Add (or replace) a member and publish the new snapshot.
    pub fn upsert(&self, info: ServerInfo) {
        let mut members = self.members.lock().expect("fleet lock");
        members.retain(|m| m.server_id != info.server_id);
        members.push(info);
        self.fleet.set(members.clone());
    }

    /// Drop a member and publish the new snapshot.
    pub fn remove(&self, server_id: &str) {
        let mut members = self.members.lock().expect("fleet lock");
        members.retain(|m| m.server_id != server_id);
        self.fleet.set(members.clone());
    }

    /// Adjust one member's state in place.
    pub fn set_state(&self, server_id: &str, state: ServerState) {
        let mut members = self.members.lock().expect("fleet lock");
        for member in members.iter_mut() {
            if member.server_id == server_id {
                member.state = state;
            }
        }
        self.fleet.set(members.clone());
    }
}

// ---------------------------------------------------------------------------
// PlayNodeHarness
// ---------------------------------------------------------------------------

pub struct PlayNodeHarness {
    pub info: ServerInfo,
    pub dispatcher: Arc<PlayDispatcher>,
    pub sessions: Arc<SessionRegistry>,
    pub cache: Arc<RequestCache>,
    pub communicator: Arc<MeshCommunicator>,
    pub tcp_addr: std::net::SocketAddr,
    resolver: AddressResolver,
    _session_server: SessionServer,
    _mesh_server: MeshServer,
}

impl PlayNodeHarness {
    /// Boot a play node with `registry` content, register it in `fleet`
    /// with `weight`, and run one discovery cycle.
    pub async fn start(
        server_id: &str,
        nid: &str,
        service_id: u16,
        registry: ContentRegistry,
        fleet: &Arc<TestFleet>,
        request_timeout: Duration,
    ) -> Self {
        let center = Arc::new(ServerInfoCenter::new());
        let cache = RequestCache::new();
        cache.start_sweeper();
        let communicator =
            MeshCommunicator::new(Arc::clone(&cache), ph_protocol::DEFAULT_MAX_PACKET_SIZE);
        let sessions = Arc::new(SessionRegistry::new());

        let node = NodeContext::new(
            server_id,
            nid,
            service_id,
            Arc::clone(&center),
            Arc::clone(&communicator),
            Arc::clone(&cache),
            Some(Arc::clone(&sessions)),
            request_timeout,
        );
        let dispatcher = PlayDispatcher::new(Arc::clone(&node), Arc::new(registry));

        let session_server = SessionServer::start_with_registry(
            TransportConfig {
                tcp_bind: Some("127.0.0.1:0".to_owned()),
                ..TransportConfig::default()
            },
            Arc::clone(&sessions),
            Arc::clone(&dispatcher) as Arc<dyn ph_transport::SessionHandler>,
        )
        .await
        .expect("session transport");
        let tcp_addr = session_server.tcp_addr().expect("tcp bound");

        let mesh_server = MeshServer::bind(
            "127.0.0.1:0",
            MeshNode {
                cache: Arc::clone(&cache),
                handler: Arc::clone(&dispatcher) as Arc<dyn mesh_core::RouteHandler>,
                client_sink: Some(Arc::new(SessionSink(Arc::clone(&sessions)))),
                max_packet_size: ph_protocol::DEFAULT_MAX_PACKET_SIZE,
            },
        )
        .await
        .expect("mesh listener");

        let info = ServerInfo {
            server_id: server_id.to_owned(),
            nid: nid.to_owned(),
            service_id,
            server_type: ServerType::Play,
            address: mesh_server.local_addr().to_string(),
            state: ServerState::Running,
            weight: 1,
            last_heartbeat: 0,
        };
        fleet.upsert(info.clone());

        let resolver = AddressResolver::new(
            info.clone(),
            fleet.provider() as Arc<dyn FleetProvider>,
            Arc::clone(&center),
            Arc::clone(&communicator),
            Some(Arc::clone(&dispatcher) as Arc<dyn ServerListListener>),
        );
        resolver.run_once().await.expect("initial discovery");

        PlayNodeHarness {
            info,
            dispatcher,
            sessions,
            cache,
            communicator,
            tcp_addr,
            resolver,
            _session_server: session_server,
            _mesh_server: mesh_server,
        }
    }

    /// Step discovery once (all link management flows from here).
    pub async fn refresh(&self) {
        self.resolver.run_once().await.expect("discovery cycle");
    }
}

// ---------------------------------------------------------------------------
// ApiNodeHarness
// ---------------------------------------------------------------------------

pub struct ApiNodeHarness {
    pub info: ServerInfo,
    pub dispatcher: Arc<ApiDispatcher>,
    pub cache: Arc<RequestCache>,
    resolver: AddressResolver,
    _mesh_server: MeshServer,
}

impl ApiNodeHarness {
    /// Boot an API node with the given handlers, register it in `fleet`
    /// with `weight`, and run one discovery cycle.
    pub async fn start(
        server_id: &str,
        nid: &str,
        service_id: u16,
        weight: u16,
        handlers: Vec<(&str, Arc<dyn ApiHandler>)>,
        fleet: &Arc<TestFleet>,
    ) -> Self {
        let center = Arc::new(ServerInfoCenter::new());
        let cache = RequestCache::new();
        cache.start_sweeper();
        let communicator =
            MeshCommunicator::new(Arc::clone(&cache), ph_protocol::DEFAULT_MAX_PACKET_SIZE);

        let node = NodeContext::new(
            server_id,
            nid,
            service_id,
            Arc::clone(&center),
            Arc::clone(&communicator),
            Arc::clone(&cache),
            None,
            Duration::from_secs(30),
        );
        let mut dispatcher = ApiDispatcher::new(node);
        for (msg_id, handler) in handlers {
            dispatcher.register(msg_id, handler);
        }
        let dispatcher = dispatcher.into_shared();

        let mesh_server = MeshServer::bind(
            "127.0.0.1:0",
            MeshNode {
                cache: Arc::clone(&cache),
                handler: Arc::clone(&dispatcher) as Arc<dyn mesh_core::RouteHandler>,
                client_sink: None,
                max_packet_size: ph_protocol::DEFAULT_MAX_PACKET_SIZE,
            },
        )
        .await
        .expect("mesh listener");

        let info = ServerInfo {
            server_id: server_id.to_owned(),
            nid: nid.to_owned(),
            service_id,
            server_type: ServerType::Api,
            address: mesh_server.local_addr().to_string(),
            state: ServerState::Running,
            weight,
            last_heartbeat: 0,
        };
        fleet.upsert(info.clone());

        let resolver = AddressResolver::new(
            info.clone(),
            fleet.provider() as Arc<dyn FleetProvider>,
            Arc::clone(&center),
            Arc::clone(&communicator),
            None,
        );
        resolver.run_once().await.expect("initial discovery");

        ApiNodeHarness { info, dispatcher, cache, resolver, _mesh_server: mesh_server }
    }

    pub async fn refresh(&self) {
        self.resolver.run_once().await.expect("discovery cycle");
    }
}
