//! Per-node shared context and reply routing.
//!
//! One `NodeContext` per process: who we are, the mesh layer handles, the
//! local session table (play nodes only), and the loopback route into our
//! own dispatcher so node-local traffic never touches a socket.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use mesh_core::{
    ClientSink, MeshCommunicator, ReplyOutcome, ReplySlot, RequestCache, RouteHandler,
    ServerInfoCenter,
};
use ph_protocol::{ResponsePacket, RouteHeader, RoutePacket, flags};
use ph_transport::SessionRegistry;

// ---------------------------------------------------------------------------
// ReplyTarget
// ---------------------------------------------------------------------------

/// Where the answer to a request goes, captured from the inbound packet
/// before the handler runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub from_nid: String,
    pub service_id: u16,
    pub account_id: i64,
    pub sid: i64,
    pub stage_id: i64,
    pub msg_seq: u16,
    pub msg_id: String,
}

impl ReplyTarget {
    pub fn of(pkt: &RoutePacket) -> Self {
        ReplyTarget {
            from_nid: pkt.header.from_nid.clone(),
            service_id: pkt.header.service_id,
            account_id: pkt.header.account_id,
            sid: pkt.header.sid,
            stage_id: pkt.header.stage_id,
            msg_seq: pkt.header.msg_seq,
            msg_id: pkt.msg_id.clone(),
        }
    }

    /// Pushes (`msg_seq == 0`) get no reply.
    pub fn needs_reply(&self) -> bool {
        self.msg_seq != ph_protocol::PUSH_SEQ
    }
}

// ---------------------------------------------------------------------------
// NodeContext
// ---------------------------------------------------------------------------

pub struct NodeContext {
    pub server_id: String,
    pub nid: String,
    pub service_id: u16,
    pub center: Arc<ServerInfoCenter>,
    pub communicator: Arc<MeshCommunicator>,
    pub cache: Arc<RequestCache>,
    /// Present on play nodes; API nodes route client traffic by nid.
    pub sessions: Option<Arc<SessionRegistry>>,
    pub request_timeout: Duration,
    local_handler: Mutex<Option<Weak<dyn RouteHandler>>>,
}

impl NodeContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_id: impl Into<String>,
        nid: impl Into<String>,
        service_id: u16,
        center: Arc<ServerInfoCenter>,
        communicator: Arc<MeshCommunicator>,
        cache: Arc<RequestCache>,
        sessions: Option<Arc<SessionRegistry>>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(NodeContext {
            server_id: server_id.into(),
            nid: nid.into(),
            service_id,
            center,
            communicator,
            cache,
            sessions,
            request_timeout,
            local_handler: Mutex::new(None),
        })
    }

    /// Wire the node's own dispatcher in for loopback delivery. Held weakly;
    /// the dispatcher owns the context, not the other way around.
    pub fn set_local_handler(&self, handler: Weak<dyn RouteHandler>) {
        *self.local_handler.lock().expect("handler lock") = Some(handler);
    }

    pub fn server_id_for_nid(&self, nid: &str) -> Option<String> {
        self.center.get_by_nid(nid).map(|info| info.server_id)
    }

    fn deliver_local(&self, pkt: RoutePacket) {
        let handler = self
            .local_handler
            .lock()
            .expect("handler lock")
            .as_ref()
            .and_then(Weak::upgrade);
        match handler {
            Some(handler) => handler.on_route(pkt),
            None => warn!(msg_id = %pkt.msg_id, "no local handler, dropping loopback packet"),
        }
    }

    /// Fire-and-forget routing by nid: loop back locally or hand to the
    /// communicator.
    pub fn route(&self, target_nid: &str, pkt: RoutePacket) {
        if target_nid == self.nid {
            self.deliver_local(pkt);
            return;
        }
        match self.server_id_for_nid(target_nid) {
            Some(server_id) => self.communicator.send(&server_id, pkt),
            None => warn!(target_nid, msg_id = %pkt.msg_id, "unknown nid, dropping packet"),
        }
    }

    /// Register a pending request, stamp the fresh sequence, and route by
    /// nid. `make_slot` sees the sequence before the entry can complete.
    pub fn route_request(
        &self,
        target_nid: &str,
        mut pkt: RoutePacket,
        session: Option<i64>,
        make_slot: impl FnOnce(u16) -> ReplySlot,
    ) -> u16 {
        let target_server = if target_nid == self.nid {
            Some(self.server_id.clone())
        } else {
            self.server_id_for_nid(target_nid)
        };
        let Some(target_server) = target_server else {
            let slot = make_slot(0);
            slot(ReplyOutcome::Error(ph_protocol::error_codes::CONNECTION_CLOSED));
            return 0;
        };
        let seq =
            self.cache.register_with(&target_server, self.request_timeout, session, make_slot);
        pkt.header.msg_seq = seq;
        if target_nid == self.nid {
            self.deliver_local(pkt);
        } else {
            self.communicator.send(&target_server, pkt);
        }
        seq
    }

    /// Same, but the target is a server id (system/service traffic selected
    /// from the center).
    pub fn request_to_server(
        &self,
        server_id: &str,
        mut pkt: RoutePacket,
        session: Option<i64>,
        make_slot: impl FnOnce(u16) -> ReplySlot,
    ) -> u16 {
        let seq = self.cache.register_with(server_id, self.request_timeout, session, make_slot);
        pkt.header.msg_seq = seq;
        if server_id == self.server_id {
            self.deliver_local(pkt);
        } else {
            self.communicator.send(server_id, pkt);
        }
        seq
    }

    /// Fire-and-forget by server id.
    pub fn send_to_server(&self, server_id: &str, pkt: RoutePacket) {
        if server_id == self.server_id {
            self.deliver_local(pkt);
        } else {
            self.communicator.send(server_id, pkt);
        }
    }

    // -----------------------------------------------------------------------
    // Replies
    // -----------------------------------------------------------------------

    /// Answer the request `target` describes. Local session origins get a
    /// response frame; local stage origins complete the request cache; mesh
    /// origins get a reply route packet on the peer's link.
    pub fn reply(&self, target: &ReplyTarget, error_code: u16, payload: Bytes) {
        if !target.needs_reply() {
            return;
        }
        if target.from_nid == self.nid {
            if target.sid != 0 {
                if let Some(sessions) = &self.sessions {
                    sessions.send_response(
                        target.sid,
                        ResponsePacket {
                            msg_id: target.msg_id.clone(),
                            msg_seq: target.msg_seq,
                            stage_id: target.stage_id,
                            error_code,
                            original_size: 0,
                            payload,
                        },
                    );
                } else {
                    warn!(sid = target.sid, "reply to a session on a node without sessions");
                }
                return;
            }
            // Node-local request: complete the cache directly.
            let outcome = if error_code == 0 {
                ReplyOutcome::Reply(self.reply_packet(target, error_code, payload))
            } else {
                ReplyOutcome::Error(error_code)
            };
            self.cache.complete(target.msg_seq, outcome);
            return;
        }
        match self.server_id_for_nid(&target.from_nid) {
            Some(server_id) => {
                let pkt = self.reply_packet(target, error_code, payload);
                self.communicator.send(&server_id, pkt);
            }
            None => warn!(from_nid = %target.from_nid, "reply target vanished from the fleet"),
        }
    }

    fn reply_packet(&self, target: &ReplyTarget, error_code: u16, payload: Bytes) -> RoutePacket {
        RoutePacket {
            header: RouteHeader {
                from_nid: self.nid.clone(),
                service_id: target.service_id,
                account_id: target.account_id,
                sid: target.sid,
                stage_id: target.stage_id,
                msg_seq: target.msg_seq,
                error_code,
                flags: flags::REPLY,
            },
            msg_id: target.msg_id.clone(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Session sink (mesh → local client delivery)
// ---------------------------------------------------------------------------

/// Adapter giving the mesh listener access to the local session table for
/// `TO_CLIENT` packets.
pub struct SessionSink(pub Arc<SessionRegistry>);

impl ClientSink for SessionSink {
    fn deliver(&self, sid: i64, response: ResponsePacket) {
        if !self.0.send_response(sid, response) {
            warn!(sid, "client-bound packet for a session that is gone");
        }
    }
}
