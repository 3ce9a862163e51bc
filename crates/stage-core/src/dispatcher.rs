//! Play dispatcher.
//!
//! Owns the `stage_id → mailbox` registry for one play node and classifies
//! every inbound packet: known system commands run their lifecycle flows,
//! everything else posts onto the target stage's loop (or answers
//! `StageNotFound`). Client traffic arrives from the session transport,
//! mesh traffic from the mesh listener; both funnel through here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tracing::{debug, warn};

use mesh_core::{RouteHandler, ServerChange, ServerListListener, ServerType};
use ph_protocol::{
    ClientPacket, RoutePacket, error_codes,
    system::{StageReq, commands},
};
use ph_transport::{SessionHandle, SessionHandler};

use crate::content::{ClientEndpoint, ContentRegistry};
use crate::event_loop::{CreateRequest, JoinRequest, StageCore, StageHandle, StageMessage, spawn_stage};
use crate::node::{NodeContext, ReplyTarget};
use crate::sender::StageSender;

// Server-allocated stage ids live far above anything clients pick.
const ALLOCATED_STAGE_ID_BASE: i64 = 1 << 40;

// ---------------------------------------------------------------------------
// Account index
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AccountMaps {
    by_account: HashMap<String, i64>,
    /// Numeric alias (accounts that parse as i64) → account string, for
    /// mesh packets that carry only the numeric form.
    by_alias: HashMap<i64, String>,
}

/// `account_id → stage_id` lookup maintained by the stage loops on join,
/// leave, and destroy.
#[derive(Default)]
pub struct AccountIndex {
    inner: Mutex<AccountMaps>,
}

impl AccountIndex {
    pub fn insert(&self, account_id: &str, stage_id: i64) {
        let mut maps = self.inner.lock().expect("account lock");
        maps.by_account.insert(account_id.to_owned(), stage_id);
        if let Ok(alias) = account_id.parse::<i64>() {
            maps.by_alias.insert(alias, account_id.to_owned());
        }
    }

    pub fn remove(&self, account_id: &str) {
        let mut maps = self.inner.lock().expect("account lock");
        maps.by_account.remove(account_id);
        if let Ok(alias) = account_id.parse::<i64>() {
            maps.by_alias.remove(&alias);
        }
    }

    pub fn stage_of(&self, account_id: &str) -> Option<i64> {
        self.inner.lock().expect("account lock").by_account.get(account_id).copied()
    }

    pub fn account_for_alias(&self, alias: i64) -> Option<String> {
        self.inner.lock().expect("account lock").by_alias.get(&alias).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("account lock").by_account.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// PlayDispatcher
// ---------------------------------------------------------------------------

pub struct PlayDispatcher {
    node: Arc<NodeContext>,
    content: Arc<ContentRegistry>,
    stages: Mutex<HashMap<i64, StageHandle>>,
    accounts: Arc<AccountIndex>,
    next_stage_id: AtomicI64,
    weak_self: Weak<PlayDispatcher>,
}

impl PlayDispatcher {
    /// Build the dispatcher and wire it in as the node's local route
    /// handler.
    pub fn new(node: Arc<NodeContext>, content: Arc<ContentRegistry>) -> Arc<Self> {
        let this = Arc::new_cyclic(|weak| PlayDispatcher {
            node,
            content,
            stages: Mutex::new(HashMap::new()),
            accounts: Arc::new(AccountIndex::default()),
            next_stage_id: AtomicI64::new(ALLOCATED_STAGE_ID_BASE),
            weak_self: weak.clone(),
        });
        let weak: Weak<dyn RouteHandler> = Arc::downgrade(&this) as Weak<dyn RouteHandler>;
        this.node.set_local_handler(weak);
        this
    }

    pub fn node(&self) -> &Arc<NodeContext> {
        &self.node
    }

    pub fn stage_count(&self) -> usize {
        self.stages.lock().expect("stages lock").len()
    }

    pub fn has_stage(&self, stage_id: i64) -> bool {
        self.stages.lock().expect("stages lock").contains_key(&stage_id)
    }

    pub fn accounts(&self) -> &Arc<AccountIndex> {
        &self.accounts
    }

    /// Destroy every stage (shutdown, or this node leaving the fleet).
    pub fn destroy_all(&self) {
        let handles: Vec<StageHandle> =
            self.stages.lock().expect("stages lock").values().cloned().collect();
        for handle in handles {
            handle.post(StageMessage::Destroy { reply: None });
        }
    }

    // -----------------------------------------------------------------------
    // Inbound classification
    // -----------------------------------------------------------------------

    /// A frame from a local client session.
    pub fn on_client_packet(&self, session: &SessionHandle, packet: ClientPacket) {
        let routed = RoutePacket::from_client(
            packet,
            &self.node.nid,
            self.node.service_id,
            session.sid(),
        );
        if commands::is_system(&routed.msg_id) {
            self.handle_system(routed, Some(session));
            return;
        }

        let reply = ReplyTarget::of(&routed);
        let is_request = routed.header.is_request();
        let handle = self.stage_handle(routed.header.stage_id);
        match handle {
            Some(handle) => match session.binding() {
                Some(binding) => {
                    handle.post(StageMessage::ClientRoute {
                        account_id: binding.account_id,
                        packet: routed,
                    });
                }
                None => {
                    debug!(sid = session.sid(), msg_id = %routed.msg_id, "packet before join");
                    if is_request {
                        self.node.reply(&reply, error_codes::AUTHENTICATION_FAILED, Bytes::new());
                    }
                }
            },
            None => {
                if is_request {
                    self.node.reply(&reply, error_codes::STAGE_NOT_FOUND, Bytes::new());
                }
            }
        }
    }

    fn stage_handle(&self, stage_id: i64) -> Option<StageHandle> {
        self.stages.lock().expect("stages lock").get(&stage_id).cloned()
    }

    // -----------------------------------------------------------------------
    // System commands
    // -----------------------------------------------------------------------

    fn handle_system(&self, packet: RoutePacket, session: Option<&SessionHandle>) {
        let reply = ReplyTarget::of(&packet);
        match packet.msg_id.as_str() {
            commands::CREATE_STAGE | commands::GET_OR_CREATE_STAGE => {
                let get_or_create = packet.msg_id == commands::GET_OR_CREATE_STAGE;
                let req = match StageReq::decode(&packet.payload) {
                    Ok(req) => req,
                    Err(e) => {
                        warn!(error = %e, "malformed stage request payload");
                        self.node.reply(&reply, error_codes::PROTOCOL_VIOLATION, Bytes::new());
                        return;
                    }
                };
                let stage_id = self.resolve_stage_id(packet.header.stage_id);
                self.create_or_post(
                    stage_id,
                    &req.stage_type,
                    CreateRequest { payload: req.body, get_or_create, reply, then_join: None },
                );
            }
            commands::JOIN_STAGE | commands::CREATE_JOIN_STAGE => {
                let req = match StageReq::decode(&packet.payload) {
                    Ok(req) => req,
                    Err(e) => {
                        warn!(error = %e, "malformed join payload");
                        self.node.reply(&reply, error_codes::PROTOCOL_VIOLATION, Bytes::new());
                        return;
                    }
                };
                let stage_id = self.resolve_stage_id(packet.header.stage_id);
                let bind = session.map(|s| {
                    let session = s.clone();
                    Box::new(move |account_id: &str, stage_id: i64| {
                        session.bind(account_id, stage_id);
                    }) as Box<dyn FnOnce(&str, i64) + Send>
                });
                let join = JoinRequest {
                    endpoint: self.endpoint_of(&packet, session),
                    auth: req.body,
                    reply: reply.clone(),
                    was_created: false,
                    bind,
                };
                match self.stage_handle(stage_id) {
                    Some(handle) => {
                        handle.post(StageMessage::JoinActor(join));
                    }
                    None => self.create_or_post(
                        stage_id,
                        &req.stage_type,
                        CreateRequest {
                            payload: req.extra,
                            get_or_create: true,
                            reply,
                            then_join: Some(join),
                        },
                    ),
                }
            }
            commands::DISCONNECT_NOTICE => {
                if let Some((account_id, handle)) = self.actor_stage(&packet) {
                    handle.post(StageMessage::Disconnect { account_id });
                }
            }
            commands::RECONNECT => {
                match self.actor_stage(&packet) {
                    Some((account_id, handle)) => {
                        handle.post(StageMessage::Reconnect {
                            account_id,
                            endpoint: self.endpoint_of(&packet, session),
                            reply,
                        });
                    }
                    None => {
                        self.node.reply(&reply, error_codes::ACTOR_NOT_FOUND, Bytes::new());
                    }
                }
            }
            commands::DESTROY_STAGE => {
                match self.stage_handle(packet.header.stage_id) {
                    Some(handle) => {
                        handle.post(StageMessage::Destroy { reply: Some(reply) });
                    }
                    // Destroying what does not exist is a no-op.
                    None => self.node.reply(&reply, error_codes::SUCCESS, Bytes::new()),
                }
            }
            other => {
                warn!(msg_id = other, "unhandled system packet");
                if packet.header.is_request() {
                    self.node.reply(&reply, error_codes::INTERNAL_ERROR, Bytes::new());
                }
            }
        }
    }

    /// Locate the actor a `DisconnectNotice`/`Reconnect` names: the account
    /// string travels in the payload; mesh peers that only know the numeric
    /// form fall back to the alias index.
    fn actor_stage(&self, packet: &RoutePacket) -> Option<(String, StageHandle)> {
        let account_id = if packet.payload.is_empty() {
            self.accounts.account_for_alias(packet.header.account_id)?
        } else {
            std::str::from_utf8(&packet.payload).ok()?.to_owned()
        };
        let stage_id = self.accounts.stage_of(&account_id)?;
        let handle = self.stage_handle(stage_id)?;
        Some((account_id, handle))
    }

    fn resolve_stage_id(&self, requested: i64) -> i64 {
        if requested != 0 {
            requested
        } else {
            self.next_stage_id.fetch_add(1, Ordering::Relaxed)
        }
    }

    fn endpoint_of(&self, packet: &RoutePacket, session: Option<&SessionHandle>) -> ClientEndpoint {
        match session {
            Some(session) => ClientEndpoint {
                session_nid: self.node.nid.clone(),
                sid: session.sid(),
                api_nid: String::new(),
            },
            None => {
                let from = packet.header.from_nid.clone();
                let api_nid = match self.node.center.get_by_nid(&from) {
                    Some(info) if info.server_type == ServerType::Api => from.clone(),
                    _ => String::new(),
                };
                ClientEndpoint { session_nid: from, sid: packet.header.sid, api_nid }
            }
        }
    }

    /// Post `create` to the stage, instantiating it first if absent.
    fn create_or_post(&self, stage_id: i64, stage_type: &str, create: CreateRequest) {
        let mut stages = self.stages.lock().expect("stages lock");
        if let Some(handle) = stages.get(&stage_id) {
            handle.post(StageMessage::Create(create));
            return;
        }
        let sender = StageSender::new(stage_id, Arc::clone(&self.node));
        let Some(content) = self.content.create_stage(stage_type, sender.clone()) else {
            drop(stages);
            self.node.reply(&create.reply, error_codes::INVALID_STAGE_TYPE, Bytes::new());
            return;
        };
        let core = StageCore::new(
            stage_id,
            stage_type.to_owned(),
            content,
            sender,
            Arc::clone(&self.node),
            Arc::clone(&self.content),
            Arc::clone(&self.accounts),
        );
        let weak = self.weak_self.clone();
        let handle = spawn_stage(core, move |exited_id| {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.stages.lock().expect("stages lock").remove(&exited_id);
            }
        });
        handle.post(StageMessage::Create(create));
        stages.insert(stage_id, handle);
    }
}

// ---------------------------------------------------------------------------
// Inbound surfaces
// ---------------------------------------------------------------------------

impl RouteHandler for PlayDispatcher {
    fn on_route(&self, packet: RoutePacket) {
        if commands::is_system(&packet.msg_id) || packet.header.is_system() {
            self.handle_system(packet, None);
            return;
        }
        let reply = ReplyTarget::of(&packet);
        let is_request = packet.header.is_request();
        match self.stage_handle(packet.header.stage_id) {
            Some(handle) => {
                if packet.header.account_id != 0 {
                    match self.accounts.account_for_alias(packet.header.account_id) {
                        Some(account_id) => {
                            handle.post(StageMessage::ClientRoute { account_id, packet });
                        }
                        None => {
                            if is_request {
                                self.node.reply(
                                    &reply,
                                    error_codes::ACTOR_NOT_FOUND,
                                    Bytes::new(),
                                );
                            }
                        }
                    }
                } else {
                    handle.post(StageMessage::Route(packet));
                }
            }
            None => {
                debug!(stage_id = packet.header.stage_id, msg_id = %packet.msg_id, "no such stage");
                if is_request {
                    self.node.reply(&reply, error_codes::STAGE_NOT_FOUND, Bytes::new());
                }
            }
        }
    }
}

impl SessionHandler for PlayDispatcher {
    fn on_message(&self, session: &SessionHandle, packet: ClientPacket) {
        self.on_client_packet(session, packet);
    }

    fn on_disconnect(&self, session: &SessionHandle) {
        self.node.cache.fail_session(session.sid());
        if let Some(binding) = session.binding() {
            if let Some(handle) = self.stage_handle(binding.stage_id) {
                handle.post(StageMessage::Disconnect { account_id: binding.account_id });
            }
        }
    }
}

impl ServerListListener for PlayDispatcher {
    fn on_server_list_changed(&self, changes: &[ServerChange]) {
        for change in changes {
            if let ServerChange::Removed(info) = change {
                if info.server_id == self.node.server_id {
                    warn!("this node left the fleet; destroying all stages");
                    self.destroy_all();
                    continue;
                }
                let handles: Vec<StageHandle> =
                    self.stages.lock().expect("stages lock").values().cloned().collect();
                for handle in handles {
                    handle.post(StageMessage::NodeDown { nid: info.nid.clone() });
                }
            }
        }
    }
}
