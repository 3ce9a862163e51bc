// play: the Play node service.
//
// Wires the core into a running node: session transport for clients, mesh
// listener + communicator for peers, discovery-driven resolver, and the
// play dispatcher hosting content stages. Content is injected as a
// `ContentRegistry`; the binary registers the built-in sample room, real
// deployments call `run` with their own.

pub mod config;
pub mod sample;

use std::sync::Arc;

use tracing::{info, warn};

use mesh_core::{
    AddressResolver, FleetFile, FleetProvider, MeshCommunicator, MeshNode, MeshServer,
    RequestCache, ServerInfo, ServerInfoCenter, ServerListListener, ServerState, ServerType,
};
use ph_transport::{SessionRegistry, SessionServer, TransportConfig};
use stage_core::{ContentRegistry, NodeContext, PlayDispatcher, SessionSink};

use crate::config::PlayConfig;

/// Everything a running play node holds. Dropping it stops accepting; call
/// [`PlayNode::shutdown`] for the graceful path.
pub struct PlayNode {
    pub dispatcher: Arc<PlayDispatcher>,
    pub sessions: Arc<SessionRegistry>,
    session_server: SessionServer,
    _mesh_server: MeshServer,
    _resolver_task: tokio::task::JoinHandle<()>,
    _sweeper_task: tokio::task::JoinHandle<()>,
}

impl PlayNode {
    pub fn tcp_addr(&self) -> Option<std::net::SocketAddr> {
        self.session_server.tcp_addr()
    }

    pub fn ws_addr(&self) -> Option<std::net::SocketAddr> {
        self.session_server.ws_addr()
    }

    /// Stop intake and tear down: destroy all stages, then close every
    /// client session.
    pub fn shutdown(&self) {
        info!("play node shutting down");
        self.dispatcher.destroy_all();
        self.sessions.close_all("server shutdown");
    }
}

/// Boot a play node from its config with the given content.
pub async fn start(
    cfg: PlayConfig,
    registry: ContentRegistry,
) -> Result<PlayNode, Box<dyn std::error::Error + Send + Sync>> {
    if cfg.transport.tls.enabled {
        // The core takes an already-negotiated stream; see the deployment
        // notes for terminating TLS in front of the node.
        warn!("transport.tls is configured but termination happens upstream of this node");
    }

    let center = Arc::new(ServerInfoCenter::new());
    let cache = RequestCache::new();
    let sweeper_task = cache.start_sweeper();
    let communicator =
        MeshCommunicator::new(Arc::clone(&cache), cfg.transport.max_packet_size);
    let sessions = Arc::new(SessionRegistry::new());

    let node = NodeContext::new(
        cfg.node.server_id.clone(),
        cfg.node.nid.clone(),
        cfg.node.service_id,
        Arc::clone(&center),
        Arc::clone(&communicator),
        Arc::clone(&cache),
        Some(Arc::clone(&sessions)),
        cfg.request_timeout,
    );
    let dispatcher = PlayDispatcher::new(node, Arc::new(registry));

    let session_server = SessionServer::start_with_registry(
        TransportConfig {
            tcp_bind: cfg.transport.tcp_bind.clone(),
            ws_bind: cfg.transport.ws_bind.clone(),
            ws_path: cfg.transport.ws_path.clone(),
            max_packet_size: cfg.transport.max_packet_size,
            heartbeat_timeout: cfg.transport.heartbeat_timeout,
            receive_buffer_size: cfg.transport.receive_buffer_size,
            send_buffer_size: cfg.transport.send_buffer_size,
            pause_writer_threshold: cfg.transport.pause_writer_threshold,
            resume_writer_threshold: cfg.transport.resume_writer_threshold,
            tcp_keepalive: cfg.transport.tcp_keepalive,
            ..TransportConfig::default()
        },
        Arc::clone(&sessions),
        Arc::clone(&dispatcher) as Arc<dyn ph_transport::SessionHandler>,
    )
    .await?;

    let mesh_server = MeshServer::bind(
        &cfg.mesh.bind,
        MeshNode {
            cache: Arc::clone(&cache),
            handler: Arc::clone(&dispatcher) as Arc<dyn mesh_core::RouteHandler>,
            client_sink: Some(Arc::new(SessionSink(Arc::clone(&sessions)))),
            max_packet_size: cfg.transport.max_packet_size,
        },
    )
    .await?;

    let me = ServerInfo {
        server_id: cfg.node.server_id.clone(),
        nid: cfg.node.nid.clone(),
        service_id: cfg.node.service_id,
        server_type: ServerType::Play,
        address: cfg.mesh.advertise.clone(),
        state: ServerState::Running,
        weight: 1,
        last_heartbeat: 0,
    };
    let resolver = AddressResolver::new(
        me,
        Arc::new(FleetFile::new(cfg.discovery.fleet_file.clone())) as Arc<dyn FleetProvider>,
        center,
        communicator,
        Some(Arc::clone(&dispatcher) as Arc<dyn ServerListListener>),
    );
    let resolver_task = resolver.spawn(cfg.discovery.refresh_interval);

    info!(
        server_id = %cfg.node.server_id,
        nid = %cfg.node.nid,
        mesh = %cfg.mesh.bind,
        "play node up"
    );

    Ok(PlayNode {
        dispatcher,
        sessions,
        session_server,
        _mesh_server: mesh_server,
        _resolver_task: resolver_task,
        _sweeper_task: sweeper_task,
    })
}
