//! API node dispatch.
//!
//! API nodes run stateless handlers: one registered `ApiHandler` per
//! `msg_id`, each invocation on its own task — there is no serialization
//! requirement and no stage loop on this side. Handlers get the packet and
//! an `ApiSender` pre-armed to answer the originating request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::warn;

use mesh_core::{ReplyOutcome, RouteHandler, SelectionPolicy, ServerType};
use ph_protocol::{Packet, RouteHeader, RoutePacket, error_codes, flags};

use crate::node::{NodeContext, ReplyTarget};
use crate::sender::resolve;

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// One stateless request handler. Runs on a fresh task per packet.
#[async_trait]
pub trait ApiHandler: Send + Sync {
    async fn handle(&self, packet: RoutePacket, sender: ApiSender);
}

// ---------------------------------------------------------------------------
// ApiDispatcher
// ---------------------------------------------------------------------------

pub struct ApiDispatcher {
    node: Arc<NodeContext>,
    handlers: HashMap<String, Arc<dyn ApiHandler>>,
}

impl ApiDispatcher {
    pub fn new(node: Arc<NodeContext>) -> Self {
        ApiDispatcher { node, handlers: HashMap::new() }
    }

    /// Register the handler for `msg_id`, replacing any previous one.
    pub fn register(&mut self, msg_id: impl Into<String>, handler: Arc<dyn ApiHandler>) {
        self.handlers.insert(msg_id.into(), handler);
    }

    pub fn node(&self) -> &Arc<NodeContext> {
        &self.node
    }

    /// Finish building: wire in as the node's local handler and share.
    pub fn into_shared(self) -> Arc<Self> {
        let this = Arc::new(self);
        let weak: Weak<dyn RouteHandler> = Arc::downgrade(&this) as Weak<dyn RouteHandler>;
        this.node.set_local_handler(weak);
        this
    }
}

impl RouteHandler for ApiDispatcher {
    fn on_route(&self, packet: RoutePacket) {
        match self.handlers.get(&packet.msg_id) {
            Some(handler) => {
                let handler = Arc::clone(handler);
                let sender = ApiSender::for_packet(Arc::clone(&self.node), &packet);
                tokio::spawn(async move {
                    handler.handle(packet, sender).await;
                });
            }
            None => {
                warn!(msg_id = %packet.msg_id, "no api handler registered");
                if packet.header.is_request() {
                    self.node.reply(
                        &ReplyTarget::of(&packet),
                        error_codes::INTERNAL_ERROR,
                        Bytes::new(),
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ApiSender
// ---------------------------------------------------------------------------

/// Outbound surface for API handlers (and other stateless callers).
#[derive(Clone)]
pub struct ApiSender {
    node: Arc<NodeContext>,
    reply_context: Arc<Mutex<Option<ReplyTarget>>>,
}

impl ApiSender {
    pub fn new(node: Arc<NodeContext>) -> Self {
        ApiSender { node, reply_context: Arc::new(Mutex::new(None)) }
    }

    fn for_packet(node: Arc<NodeContext>, packet: &RoutePacket) -> Self {
        let target = packet.header.is_request().then(|| ReplyTarget::of(packet));
        ApiSender { node, reply_context: Arc::new(Mutex::new(target)) }
    }

    /// Answer the request this sender was armed with.
    pub fn reply(&self, payload: Bytes) {
        self.reply_with(error_codes::SUCCESS, payload);
    }

    pub fn reply_error(&self, error_code: u16) {
        self.reply_with(error_code, Bytes::new());
    }

    fn reply_with(&self, error_code: u16, payload: Bytes) {
        let target = self.reply_context.lock().expect("reply lock").take();
        match target {
            Some(target) => self.node.reply(&target, error_code, payload),
            None => warn!("api reply outside a request context"),
        }
    }

    /// Fire-and-forget to a specific API (or any) server by id.
    pub fn send_to_api(&self, server_id: &str, packet: &dyn Packet) {
        self.node.send_to_server(server_id, self.packet(0, packet, 0));
    }

    pub fn request_to_api(
        &self,
        server_id: &str,
        packet: &dyn Packet,
    ) -> impl std::future::Future<Output = Result<RoutePacket, u16>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        let pkt = self.packet(0, packet, 0);
        self.node.request_to_server(server_id, pkt, None, move |_seq| {
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            })
        });
        resolve(rx)
    }

    /// Fire-and-forget to a stage on a play node.
    pub fn send_to_stage(&self, play_nid: &str, stage_id: i64, packet: &dyn Packet) {
        self.node.route(play_nid, self.packet(stage_id, packet, 0));
    }

    pub fn request_to_stage(
        &self,
        play_nid: &str,
        stage_id: i64,
        packet: &dyn Packet,
    ) -> impl std::future::Future<Output = Result<RoutePacket, u16>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        let pkt = self.packet(stage_id, packet, 0);
        self.node.route_request(play_nid, pkt, None, move |_seq| {
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            })
        });
        resolve(rx)
    }

    pub fn send_to_service(
        &self,
        server_type: ServerType,
        service_id: u16,
        policy: SelectionPolicy,
        packet: &dyn Packet,
    ) {
        match self.node.center.select(service_id, server_type, policy) {
            Some(info) => self.node.send_to_server(&info.server_id, self.packet(0, packet, 0)),
            None => warn!(service_id, msg_id = %packet.msg_id(), "no server for service, dropping"),
        }
    }

    pub fn request_to_service(
        &self,
        server_type: ServerType,
        service_id: u16,
        policy: SelectionPolicy,
        packet: &dyn Packet,
    ) -> impl std::future::Future<Output = Result<RoutePacket, u16>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        match self.node.center.select(service_id, server_type, policy) {
            Some(info) => {
                let pkt = self.packet(0, packet, 0);
                self.node.request_to_server(&info.server_id, pkt, None, move |_seq| {
                    Box::new(move |outcome| {
                        let _ = tx.send(outcome);
                    })
                });
            }
            None => {
                let _ = tx.send(ReplyOutcome::Error(error_codes::CONNECTION_CLOSED));
            }
        }
        resolve(rx)
    }

    /// Framework-level message to a specific server.
    pub fn send_to_system(&self, server_id: &str, packet: &dyn Packet) {
        self.node.send_to_server(server_id, self.packet(0, packet, flags::SYSTEM));
    }

    pub fn request_to_system(
        &self,
        server_id: &str,
        packet: &dyn Packet,
    ) -> impl std::future::Future<Output = Result<RoutePacket, u16>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        let pkt = self.packet(0, packet, flags::SYSTEM);
        self.node.request_to_server(server_id, pkt, None, move |_seq| {
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            })
        });
        resolve(rx)
    }

    fn packet(&self, stage_id: i64, packet: &dyn Packet, packet_flags: u8) -> RoutePacket {
        RoutePacket {
            header: RouteHeader {
                from_nid: self.node.nid.clone(),
                service_id: self.node.service_id,
                account_id: 0,
                sid: 0,
                stage_id,
                msg_seq: 0,
                error_code: 0,
                flags: packet_flags,
            },
            msg_id: packet.msg_id().to_owned(),
            payload: packet.to_payload(),
        }
    }
}
