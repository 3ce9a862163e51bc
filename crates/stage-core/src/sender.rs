//! Sender façades.
//!
//! `StageSender` is the outbound API a stage's content holds; `ActorSender`
//! adds the per-actor client endpoint on top. Every `send_*` is
//! fire-and-forget; every `request_*` resolves with the reply packet or a
//! non-zero error code within the node's request timeout, and its
//! completion is routed back through the owning stage's mailbox (await-style
//! requests resume the suspended handler, callback-style requests arrive as
//! a `ReplyCallback` item).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::warn;

use mesh_core::{ReplyOutcome, ReplySlot, SelectionPolicy, ServerType};
use ph_protocol::{Packet, ResponsePacket, RouteHeader, RoutePacket, error_codes, flags};

use crate::content::{ActorLink, ClientEndpoint};
use crate::event_loop::{ReplyClosure, StageHandle, StageMessage, TimerCallback};
use crate::node::{NodeContext, ReplyTarget};
use crate::timer;

// ---------------------------------------------------------------------------
// SenderCore
// ---------------------------------------------------------------------------

pub(crate) struct SenderCore {
    stage_id: i64,
    node: Arc<NodeContext>,
    handle: OnceLock<StageHandle>,
    /// Header of the request currently being dispatched on the loop.
    reply_context: Mutex<Option<ReplyTarget>>,
    /// Sequences of this stage's in-flight requests, for destroy-time
    /// cancellation.
    pending: Mutex<HashSet<u16>>,
    timers: Mutex<HashMap<u64, tokio::task::AbortHandle>>,
    next_timer_id: AtomicU64,
}

impl SenderCore {
    pub(crate) fn handle(&self) -> Option<StageHandle> {
        self.handle.get().cloned()
    }

    pub(crate) fn track_timer(&self, timer_id: u64, abort: tokio::task::AbortHandle) {
        self.timers.lock().expect("timer lock").insert(timer_id, abort);
    }

    pub(crate) fn drop_timer(&self, timer_id: u64) {
        self.timers.lock().expect("timer lock").remove(&timer_id);
    }

    pub(crate) fn has_timer(&self, timer_id: u64) -> bool {
        self.timers.lock().expect("timer lock").contains_key(&timer_id)
    }
}

// ---------------------------------------------------------------------------
// StageSender
// ---------------------------------------------------------------------------

/// Outbound surface of one stage. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct StageSender {
    inner: Arc<SenderCore>,
}

impl StageSender {
    pub(crate) fn new(stage_id: i64, node: Arc<NodeContext>) -> Self {
        StageSender {
            inner: Arc::new(SenderCore {
                stage_id,
                node,
                handle: OnceLock::new(),
                reply_context: Mutex::new(None),
                pending: Mutex::new(HashSet::new()),
                timers: Mutex::new(HashMap::new()),
                next_timer_id: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn attach(&self, handle: StageHandle) {
        let _ = self.inner.handle.set(handle);
    }

    pub fn stage_id(&self) -> i64 {
        self.inner.stage_id
    }

    // -----------------------------------------------------------------------
    // Reply to the currently-dispatched request
    // -----------------------------------------------------------------------

    /// Answer the request currently being dispatched with a success payload.
    pub fn reply(&self, payload: Bytes) {
        self.reply_with(error_codes::SUCCESS, payload);
    }

    /// Answer the request currently being dispatched with an error code.
    pub fn reply_error(&self, error_code: u16) {
        self.reply_with(error_code, Bytes::new());
    }

    fn reply_with(&self, error_code: u16, payload: Bytes) {
        let target = self.inner.reply_context.lock().expect("reply lock").take();
        match target {
            Some(target) => self.inner.node.reply(&target, error_code, payload),
            None => warn!(stage_id = self.inner.stage_id, "reply outside a request context"),
        }
    }

    // -----------------------------------------------------------------------
    // Client, stage, system, service sends
    // -----------------------------------------------------------------------

    /// Push a message to the client behind `endpoint`.
    pub fn send_to_client(&self, endpoint: &ClientEndpoint, packet: &dyn Packet) {
        push_to_endpoint(&self.inner.node, self.inner.stage_id, endpoint, packet);
    }

    /// Fire-and-forget to a stage, addressed by its owning play node.
    pub fn send_to_stage(&self, play_nid: &str, stage_id: i64, packet: &dyn Packet) {
        let pkt = self.base_packet(stage_id, packet, 0);
        self.inner.node.route(play_nid, pkt);
    }

    /// Request/reply to a stage on `play_nid`.
    pub fn request_to_stage(
        &self,
        play_nid: &str,
        stage_id: i64,
        packet: &dyn Packet,
    ) -> impl std::future::Future<Output = Result<RoutePacket, u16>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        let pkt = self.base_packet(stage_id, packet, 0);
        let make_slot = self.tracked_slot(move |outcome| {
            let _ = tx.send(outcome);
        });
        self.inner.node.route_request(play_nid, pkt, None, make_slot);
        resolve(rx)
    }

    /// Request/reply to a stage, resolved as a `ReplyCallback` item on this
    /// stage's own loop.
    pub fn request_to_stage_callback(
        &self,
        play_nid: &str,
        stage_id: i64,
        packet: &dyn Packet,
        callback: ReplyClosure,
    ) {
        let handle = self.inner.handle();
        let pkt = self.base_packet(stage_id, packet, 0);
        let make_slot = self.tracked_slot(move |outcome| match handle {
            Some(handle) => {
                handle.post(StageMessage::ReplyCallback { callback, outcome });
            }
            None => warn!("reply callback for a stage that never started"),
        });
        self.inner.node.route_request(play_nid, pkt, None, make_slot);
    }

    /// Framework-level message to a specific server.
    pub fn send_to_system(&self, server_id: &str, packet: &dyn Packet) {
        let pkt = self.base_packet(0, packet, flags::SYSTEM);
        self.inner.node.send_to_server(server_id, pkt);
    }

    pub fn request_to_system(
        &self,
        server_id: &str,
        packet: &dyn Packet,
    ) -> impl std::future::Future<Output = Result<RoutePacket, u16>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        let pkt = self.base_packet(0, packet, flags::SYSTEM);
        let make_slot = self.tracked_slot(move |outcome| {
            let _ = tx.send(outcome);
        });
        self.inner.node.request_to_server(server_id, pkt, None, make_slot);
        resolve(rx)
    }

    /// Fire-and-forget to any server of a service group.
    pub fn send_to_service(
        &self,
        server_type: ServerType,
        service_id: u16,
        policy: SelectionPolicy,
        packet: &dyn Packet,
    ) {
        match self.inner.node.center.select(service_id, server_type, policy) {
            Some(info) => {
                let pkt = self.base_packet(0, packet, 0);
                self.inner.node.send_to_server(&info.server_id, pkt);
            }
            None => {
                warn!(service_id, msg_id = %packet.msg_id(), "no server for service, dropping");
            }
        }
    }

    /// Request/reply to a server of a service group picked by `policy`
    /// (round-robin unless stated otherwise).
    pub fn request_to_service(
        &self,
        server_type: ServerType,
        service_id: u16,
        policy: SelectionPolicy,
        packet: &dyn Packet,
    ) -> impl std::future::Future<Output = Result<RoutePacket, u16>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        match self.inner.node.center.select(service_id, server_type, policy) {
            Some(info) => {
                let pkt = self.base_packet(0, packet, 0);
                let make_slot = self.tracked_slot(move |outcome| {
                    let _ = tx.send(outcome);
                });
                self.inner.node.request_to_server(&info.server_id, pkt, None, make_slot);
            }
            None => {
                let _ = tx.send(ReplyOutcome::Error(error_codes::CONNECTION_CLOSED));
            }
        }
        resolve(rx)
    }

    // -----------------------------------------------------------------------
    // Timers and async blocks
    // -----------------------------------------------------------------------

    /// Tick `callback` on this stage's loop every `period`, forever, after
    /// `initial_delay`. Returns the timer id for cancellation.
    pub fn add_repeat_timer(
        &self,
        initial_delay: Duration,
        period: Duration,
        callback: TimerCallback,
    ) -> u64 {
        let timer_id = self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed) + 1;
        timer::spawn_repeating(Arc::clone(&self.inner), timer_id, initial_delay, period, callback);
        timer_id
    }

    /// Tick `count` times, then stop.
    pub fn add_count_timer(
        &self,
        initial_delay: Duration,
        count: u32,
        period: Duration,
        callback: TimerCallback,
    ) -> u64 {
        let timer_id = self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed) + 1;
        timer::spawn_counted(
            Arc::clone(&self.inner),
            timer_id,
            initial_delay,
            count,
            period,
            callback,
        );
        timer_id
    }

    /// Stop a timer. Ticks already queued are skipped, not run.
    pub fn cancel_timer(&self, timer_id: u64) {
        if let Some(abort) = self.inner.timers.lock().expect("timer lock").remove(&timer_id) {
            abort.abort();
        }
    }

    pub fn has_timer(&self, timer_id: u64) -> bool {
        self.inner.has_timer(timer_id)
    }

    /// Run `pre` off-loop; once it completes, run `post` with its result
    /// back on this stage's loop.
    pub fn async_block<R, F, P>(&self, pre: F, post: P)
    where
        R: Send + 'static,
        F: std::future::Future<Output = R> + Send + 'static,
        P: FnOnce(&mut dyn crate::content::Stage, R) + Send + 'static,
    {
        let handle = self.inner.handle();
        tokio::spawn(async move {
            let result = pre.await;
            if let Some(handle) = handle {
                handle.post(StageMessage::Async(Box::new(move |stage| post(stage, result))));
            }
        });
    }

    // -----------------------------------------------------------------------
    // Loop-side bookkeeping
    // -----------------------------------------------------------------------

    pub(crate) fn set_reply_context(&self, target: Option<ReplyTarget>) {
        *self.inner.reply_context.lock().expect("reply lock") = target;
    }

    pub(crate) fn timer_active(&self, timer_id: u64) -> bool {
        self.inner.has_timer(timer_id)
    }

    pub(crate) fn cancel_all_timers(&self) {
        let timers: Vec<_> =
            self.inner.timers.lock().expect("timer lock").drain().map(|(_, a)| a).collect();
        for abort in timers {
            abort.abort();
        }
    }

    pub(crate) fn take_pending(&self) -> Vec<u16> {
        self.inner.pending.lock().expect("pending lock").drain().collect()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn base_packet(&self, stage_id: i64, packet: &dyn Packet, packet_flags: u8) -> RoutePacket {
        RoutePacket {
            header: RouteHeader {
                from_nid: self.inner.node.nid.clone(),
                service_id: self.inner.node.service_id,
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

    /// Wrap a delivery closure so the assigned sequence is tracked in this
    /// stage's pending set for the entry's whole lifetime.
    fn tracked_slot(
        &self,
        deliver: impl FnOnce(ReplyOutcome) + Send + 'static,
    ) -> impl FnOnce(u16) -> ReplySlot {
        let core = Arc::clone(&self.inner);
        move |seq| {
            core.pending.lock().expect("pending lock").insert(seq);
            Box::new(move |outcome| {
                core.pending.lock().expect("pending lock").remove(&seq);
                deliver(outcome);
            })
        }
    }
}

pub(crate) async fn resolve(rx: oneshot::Receiver<ReplyOutcome>) -> Result<RoutePacket, u16> {
    match rx.await {
        Ok(ReplyOutcome::Reply(pkt)) => Ok(pkt),
        Ok(ReplyOutcome::Error(code)) => Err(code),
        Err(_) => Err(error_codes::CONNECTION_CLOSED),
    }
}

// ---------------------------------------------------------------------------
// ActorSender
// ---------------------------------------------------------------------------

/// Per-actor sender: everything `StageSender` does, plus this actor's own
/// client endpoint.
#[derive(Clone)]
pub struct ActorSender {
    stage: StageSender,
    link: Arc<ActorLink>,
}

impl ActorSender {
    pub(crate) fn new(stage: StageSender, link: Arc<ActorLink>) -> Self {
        ActorSender { stage, link }
    }

    /// The stage-level operations (`reply`, `send_to_stage`, timers, …).
    pub fn stage(&self) -> &StageSender {
        &self.stage
    }

    pub fn account_id(&self) -> String {
        self.link.account_id()
    }

    /// Bind the account identity; called by content during authentication.
    pub fn set_account_id(&self, account_id: impl Into<String>) {
        self.link.set_account_id(account_id);
    }

    pub fn endpoint(&self) -> ClientEndpoint {
        self.link.endpoint()
    }

    /// Push a message to this actor's client.
    pub fn push_to_client(&self, packet: &dyn Packet) {
        let endpoint = self.link.endpoint();
        push_to_endpoint(&self.stage.inner.node, self.stage.inner.stage_id, &endpoint, packet);
    }

    /// `push_to_client` under its historical name.
    pub fn send_to_client(&self, packet: &dyn Packet) {
        self.push_to_client(packet);
    }

    /// Remove this actor from its stage (destroys the content actor on the
    /// stage loop).
    pub fn leave_stage(&self) {
        let account_id = self.link.account_id();
        if let Some(handle) = self.stage.inner.handle() {
            handle.post(StageMessage::Leave { account_id });
        }
    }
}

/// Route a push frame to whichever node holds the client's socket.
fn push_to_endpoint(
    node: &Arc<NodeContext>,
    stage_id: i64,
    endpoint: &ClientEndpoint,
    packet: &dyn Packet,
) {
    if endpoint.session_nid == node.nid {
        match &node.sessions {
            Some(sessions) => {
                sessions.send_response(
                    endpoint.sid,
                    ResponsePacket {
                        msg_id: packet.msg_id().to_owned(),
                        msg_seq: ph_protocol::PUSH_SEQ,
                        stage_id,
                        error_code: error_codes::SUCCESS,
                        original_size: 0,
                        payload: packet.to_payload(),
                    },
                );
            }
            None => warn!(sid = endpoint.sid, "client push on a node without sessions"),
        }
        return;
    }
    let pkt = RoutePacket {
        header: RouteHeader {
            from_nid: node.nid.clone(),
            service_id: node.service_id,
            account_id: 0,
            sid: endpoint.sid,
            stage_id,
            msg_seq: ph_protocol::PUSH_SEQ,
            error_code: 0,
            flags: flags::TO_CLIENT,
        },
        msg_id: packet.msg_id().to_owned(),
        payload: packet.to_payload(),
    };
    node.route(&endpoint.session_nid, pkt);
}
