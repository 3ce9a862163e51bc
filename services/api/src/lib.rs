// api: the API node service.
//
// Stateless counterpart of the play node: a mesh listener feeding the API
// dispatcher, a communicator for outbound traffic, and the resolver loop.
// Handlers are injected per msg_id; the binary registers a sample.

pub mod config;

use std::sync::Arc;

use tracing::info;

use mesh_core::{
    AddressResolver, FleetFile, FleetProvider, MeshCommunicator, MeshNode, MeshServer,
    RequestCache, ServerInfo, ServerInfoCenter, ServerState, ServerType,
};
use stage_core::{ApiDispatcher, ApiHandler, NodeContext};

use crate::config::ApiConfig;

pub struct ApiNode {
    pub dispatcher: Arc<ApiDispatcher>,
    _mesh_server: MeshServer,
    _resolver_task: tokio::task::JoinHandle<()>,
    _sweeper_task: tokio::task::JoinHandle<()>,
}

/// Boot an API node from its config with the given handlers.
pub async fn start(
    cfg: ApiConfig,
    handlers: Vec<(String, Arc<dyn ApiHandler>)>,
) -> Result<ApiNode, Box<dyn std::error::Error + Send + Sync>> {
    let center = Arc::new(ServerInfoCenter::new());
    let cache = RequestCache::new();
    let sweeper_task = cache.start_sweeper();
    let communicator = MeshCommunicator::new(Arc::clone(&cache), cfg.max_packet_size);

    let node = NodeContext::new(
        cfg.node.server_id.clone(),
        cfg.node.nid.clone(),
        cfg.node.service_id,
        Arc::clone(&center),
        Arc::clone(&communicator),
        Arc::clone(&cache),
        None,
        cfg.request_timeout,
    );
    let mut dispatcher = ApiDispatcher::new(node);
    for (msg_id, handler) in handlers {
        dispatcher.register(msg_id, handler);
    }
    let dispatcher = dispatcher.into_shared();

    let mesh_server = MeshServer::bind(
        &cfg.mesh.bind,
        MeshNode {
            cache: Arc::clone(&cache),
            handler: Arc::clone(&dispatcher) as Arc<dyn mesh_core::RouteHandler>,
            client_sink: None,
            max_packet_size: cfg.max_packet_size,
        },
    )
    .await?;

    let me = ServerInfo {
        server_id: cfg.node.server_id.clone(),
        nid: cfg.node.nid.clone(),
        service_id: cfg.node.service_id,
        server_type: ServerType::Api,
        address: cfg.mesh.advertise.clone(),
        state: ServerState::Running,
        weight: cfg.node.weight,
        last_heartbeat: 0,
    };
    let resolver = AddressResolver::new(
        me,
        Arc::new(FleetFile::new(cfg.discovery.fleet_file.clone())) as Arc<dyn FleetProvider>,
        center,
        communicator,
        None,
    );
    let resolver_task = resolver.spawn(cfg.discovery.refresh_interval);

    info!(
        server_id = %cfg.node.server_id,
        nid = %cfg.node.nid,
        mesh = %cfg.mesh.bind,
        "api node up"
    );

    Ok(ApiNode {
        dispatcher,
        _mesh_server: mesh_server,
        _resolver_task: resolver_task,
        _sweeper_task: sweeper_task,
    })
}
