//! The per-stage event loop.
//!
//! Stage state lives inside a `StageCore` owned by exactly one mailbox
//! task — mutual exclusion comes from ownership, not locks. Producers post
//! `StageMessage`s from anywhere; the task drains the backlog in batches
//! and executes items sequentially, awaiting each to completion. A slow
//! item occupies only its own stage; a panicking item is logged and
//! discarded; per-stage FIFO order is the channel's own.
//!
//! Continuations (timer ticks, async-block results, reply callbacks) carry
//! a cloned `StageHandle` captured at creation, so they always land back on
//! the owning mailbox regardless of which task completes them.

use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use mesh_core::ReplyOutcome;
use ph_protocol::{RoutePacket, error_codes, system::StageRes};

use crate::content::{Actor, ActorLink, ClientEndpoint, ContentRegistry, Stage};
use crate::dispatcher::AccountIndex;
use crate::node::{NodeContext, ReplyTarget};
use crate::sender::{ActorSender, StageSender};

/// Backlog drained per loop iteration.
const DRAIN_BATCH: usize = 64;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

pub type StageClosure = Box<dyn FnOnce(&mut dyn Stage) + Send>;
pub type TimerCallback = Arc<dyn Fn(&mut dyn Stage) + Send + Sync>;
pub type ReplyClosure = Box<dyn FnOnce(&mut dyn Stage, ReplyOutcome) + Send>;
/// Binds the originating session to the joined actor, on join success.
pub type SessionBind = Box<dyn FnOnce(&str, i64) + Send>;

pub struct CreateRequest {
    pub payload: Bytes,
    pub get_or_create: bool,
    pub reply: ReplyTarget,
    pub then_join: Option<JoinRequest>,
}

pub struct JoinRequest {
    pub endpoint: ClientEndpoint,
    pub auth: Bytes,
    pub reply: ReplyTarget,
    pub was_created: bool,
    pub bind: Option<SessionBind>,
}

pub enum StageMessage {
    /// Server-to-stage traffic: dispatched with no actor.
    Route(RoutePacket),
    /// Client-to-actor traffic: looked up by account, then dispatched.
    ClientRoute { account_id: String, packet: RoutePacket },
    Create(CreateRequest),
    JoinActor(JoinRequest),
    Reconnect { account_id: String, endpoint: ClientEndpoint, reply: ReplyTarget },
    Disconnect { account_id: String },
    Leave { account_id: String },
    /// A fleet node vanished; actors whose clients lived there go offline.
    NodeDown { nid: String },
    Destroy { reply: Option<ReplyTarget> },
    Timer { timer_id: u64, callback: TimerCallback },
    Async(StageClosure),
    ReplyCallback { callback: ReplyClosure, outcome: ReplyOutcome },
}

// ---------------------------------------------------------------------------
// StageHandle
// ---------------------------------------------------------------------------

/// Cloneable producer side of one stage's mailbox.
#[derive(Clone)]
pub struct StageHandle {
    stage_id: i64,
    tx: mpsc::UnboundedSender<StageMessage>,
}

impl StageHandle {
    pub fn stage_id(&self) -> i64 {
        self.stage_id
    }

    /// Enqueue a message; false once the stage is gone.
    pub fn post(&self, msg: StageMessage) -> bool {
        self.tx.send(msg).is_ok()
    }
}

// ---------------------------------------------------------------------------
// StageCore
// ---------------------------------------------------------------------------

pub(crate) struct ActorEntry {
    pub content: Box<dyn Actor>,
    pub link: Arc<ActorLink>,
}

/// The single-owner state of one stage. Owned by the mailbox task; nothing
/// here is shared or locked.
pub(crate) struct StageCore {
    stage_id: i64,
    stage_type: String,
    content: Box<dyn Stage>,
    actors: IndexMap<String, ActorEntry>,
    is_created: bool,
    sender: StageSender,
    node: Arc<NodeContext>,
    registry: Arc<ContentRegistry>,
    accounts: Arc<AccountIndex>,
}

impl StageCore {
    pub(crate) fn new(
        stage_id: i64,
        stage_type: String,
        content: Box<dyn Stage>,
        sender: StageSender,
        node: Arc<NodeContext>,
        registry: Arc<ContentRegistry>,
        accounts: Arc<AccountIndex>,
    ) -> Self {
        StageCore {
            stage_id,
            stage_type,
            content,
            actors: IndexMap::new(),
            is_created: false,
            sender,
            node,
            registry,
            accounts,
        }
    }

    // -----------------------------------------------------------------------
    // Message execution
    // -----------------------------------------------------------------------

    /// Execute one mailbox item. Returns false when the stage must stop.
    async fn execute(&mut self, msg: StageMessage) -> bool {
        match msg {
            StageMessage::Route(packet) => {
                self.sender.set_reply_context(reply_context(&packet));
                self.content.on_dispatch(None, packet).await;
                self.sender.set_reply_context(None);
                true
            }
            StageMessage::ClientRoute { account_id, packet } => {
                self.sender.set_reply_context(reply_context(&packet));
                match self.actors.get_mut(&account_id) {
                    Some(entry) => {
                        self.content.on_dispatch(Some(entry.content.as_mut()), packet).await;
                    }
                    None => {
                        debug!(stage_id = self.stage_id, account_id = %account_id, "no actor for client packet");
                        if packet.header.is_request() {
                            self.node.reply(
                                &ReplyTarget::of(&packet),
                                error_codes::ACTOR_NOT_FOUND,
                                Bytes::new(),
                            );
                        }
                    }
                }
                self.sender.set_reply_context(None);
                true
            }
            StageMessage::Create(req) => self.handle_create(req).await,
            StageMessage::JoinActor(join) => {
                self.handle_join(join).await;
                true
            }
            StageMessage::Reconnect { account_id, endpoint, reply } => {
                self.handle_reconnect(&account_id, endpoint, reply).await;
                true
            }
            StageMessage::Disconnect { account_id } => {
                if let Some(entry) = self.actors.get_mut(&account_id) {
                    self.content.on_connection_changed(entry.content.as_mut(), false).await;
                }
                true
            }
            StageMessage::Leave { account_id } => {
                if let Some(mut entry) = self.actors.shift_remove(&account_id) {
                    entry.content.on_destroy().await;
                    self.accounts.remove(&account_id);
                }
                true
            }
            StageMessage::NodeDown { nid } => {
                let offline: Vec<String> = self
                    .actors
                    .iter()
                    .filter(|(_, e)| e.link.endpoint().session_nid == nid)
                    .map(|(account, _)| account.clone())
                    .collect();
                for account in offline {
                    if let Some(entry) = self.actors.get_mut(&account) {
                        self.content.on_connection_changed(entry.content.as_mut(), false).await;
                    }
                }
                true
            }
            StageMessage::Destroy { reply } => {
                self.destroy().await;
                if let Some(reply) = reply {
                    self.node.reply(&reply, error_codes::SUCCESS, Bytes::new());
                }
                false
            }
            StageMessage::Timer { timer_id, callback } => {
                if self.sender.timer_active(timer_id) {
                    callback(self.content.as_mut());
                }
                true
            }
            StageMessage::Async(callback) => {
                callback(self.content.as_mut());
                true
            }
            StageMessage::ReplyCallback { callback, outcome } => {
                callback(self.content.as_mut(), outcome);
                true
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle flows
    // -----------------------------------------------------------------------

    async fn handle_create(&mut self, req: CreateRequest) -> bool {
        if self.is_created {
            match req.then_join {
                Some(join) => {
                    self.handle_join(join).await;
                }
                None if req.get_or_create => {
                    let res = StageRes { stage_id: self.stage_id, is_created: false };
                    self.node.reply(&req.reply, error_codes::SUCCESS, res.encode());
                }
                None => {
                    self.node.reply(&req.reply, error_codes::STAGE_ALREADY_EXISTS, Bytes::new());
                }
            }
            return true;
        }

        if !self.content.on_create(req.payload).await {
            self.node.reply(&req.reply, error_codes::CREATE_STAGE_REJECTED, Bytes::new());
            return false;
        }
        self.is_created = true;
        self.content.on_post_create().await;

        match req.then_join {
            Some(mut join) => {
                join.was_created = true;
                self.handle_join(join).await;
            }
            None => {
                let res = StageRes { stage_id: self.stage_id, is_created: true };
                self.node.reply(&req.reply, error_codes::SUCCESS, res.encode());
            }
        }
        true
    }

    /// The ten-step join. Executed entirely on this stage's loop.
    async fn handle_join(&mut self, join: JoinRequest) {
        // 1-2: build the sender triple and the content actor.
        let link = Arc::new(ActorLink::new(join.endpoint.clone()));
        let actor_sender = ActorSender::new(self.sender.clone(), Arc::clone(&link));
        let Some(mut actor) = self.registry.create_actor(&self.stage_type, actor_sender) else {
            self.node.reply(&join.reply, error_codes::INVALID_STAGE_TYPE, Bytes::new());
            return;
        };

        // 3-4: create, then authenticate against the opaque auth packet.
        actor.on_create().await;
        if !actor.on_authenticate(join.auth.clone()).await {
            actor.on_destroy().await;
            self.node.reply(&join.reply, error_codes::AUTHENTICATION_FAILED, Bytes::new());
            return;
        }

        // 5: the content must have bound a non-empty account id.
        let account_id = link.account_id();
        if account_id.is_empty() {
            actor.on_destroy().await;
            self.node.reply(&join.reply, error_codes::INVALID_ACCOUNT_ID, Bytes::new());
            return;
        }

        // 6.
        actor.on_post_authenticate().await;

        // 7: an actor with this account already lives here — reconnect.
        if self.actors.contains_key(&account_id) {
            actor.on_destroy().await;
            if let Some(entry) = self.actors.get_mut(&account_id) {
                entry.link.set_endpoint(join.endpoint);
                self.content.on_connection_changed(entry.content.as_mut(), true).await;
            }
            self.finish_join(&account_id, join.reply, join.was_created, join.bind);
            return;
        }

        // 8.
        if !self.content.on_join_stage(actor.as_mut()).await {
            actor.on_destroy().await;
            self.node.reply(&join.reply, error_codes::JOIN_STAGE_REJECTED, Bytes::new());
            return;
        }

        // 9.
        self.actors.insert(account_id.clone(), ActorEntry { content: actor, link });
        self.accounts.insert(&account_id, self.stage_id);
        if let Some(entry) = self.actors.get_mut(&account_id) {
            self.content.on_post_join_stage(entry.content.as_mut()).await;
        }

        // 10.
        self.finish_join(&account_id, join.reply, join.was_created, join.bind);
    }

    fn finish_join(
        &self,
        account_id: &str,
        reply: ReplyTarget,
        was_created: bool,
        bind: Option<SessionBind>,
    ) {
        if let Some(bind) = bind {
            bind(account_id, self.stage_id);
        }
        let res = StageRes { stage_id: self.stage_id, is_created: was_created };
        self.node.reply(&reply, error_codes::SUCCESS, res.encode());
    }

    async fn handle_reconnect(
        &mut self,
        account_id: &str,
        endpoint: ClientEndpoint,
        reply: ReplyTarget,
    ) {
        match self.actors.get_mut(account_id) {
            Some(entry) => {
                entry.link.set_endpoint(endpoint);
                self.content.on_connection_changed(entry.content.as_mut(), true).await;
                let res = StageRes { stage_id: self.stage_id, is_created: false };
                self.node.reply(&reply, error_codes::SUCCESS, res.encode());
            }
            None => {
                self.node.reply(&reply, error_codes::ACTOR_NOT_FOUND, Bytes::new());
            }
        }
    }

    /// Destroy actors in insertion order, then the stage itself, then cancel
    /// everything the stage still has in flight.
    async fn destroy(&mut self) {
        let actors = std::mem::take(&mut self.actors);
        for (account_id, mut entry) in actors {
            entry.content.on_destroy().await;
            self.accounts.remove(&account_id);
        }
        if self.is_created {
            self.content.on_destroy().await;
        }
        self.teardown();
    }

    /// Cancellation of timers and in-flight requests; shared by the destroy
    /// path and abnormal exits.
    fn teardown(&mut self) {
        self.sender.cancel_all_timers();
        let pending = self.sender.take_pending();
        if !pending.is_empty() {
            self.node.cache.fail_sequences(&pending, error_codes::CONNECTION_CLOSED);
        }
    }

    /// Answer queued requests that will never run because the stage is gone.
    fn refuse(&self, msg: StageMessage) {
        let target = match msg {
            StageMessage::Route(pkt) | StageMessage::ClientRoute { packet: pkt, .. } => {
                pkt.header.is_request().then(|| ReplyTarget::of(&pkt))
            }
            StageMessage::Create(req) => Some(req.reply),
            StageMessage::JoinActor(join) => Some(join.reply),
            StageMessage::Reconnect { reply, .. } => Some(reply),
            StageMessage::Destroy { reply } => {
                // Destroying an already-destroyed stage is a no-op success.
                if let Some(reply) = reply {
                    self.node.reply(&reply, error_codes::SUCCESS, Bytes::new());
                }
                None
            }
            _ => None,
        };
        if let Some(target) = target {
            self.node.reply(&target, error_codes::STAGE_NOT_FOUND, Bytes::new());
        }
    }
}

fn reply_context(packet: &RoutePacket) -> Option<ReplyTarget> {
    packet.header.is_request().then(|| ReplyTarget::of(packet))
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Start the mailbox task for `core`. `on_exit` runs once, after the loop
/// stops, so the dispatcher can drop its registry entry.
pub(crate) fn spawn_stage(
    mut core: StageCore,
    on_exit: impl FnOnce(i64) + Send + 'static,
) -> StageHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = StageHandle { stage_id: core.stage_id, tx };
    core.sender.attach(handle.clone());

    tokio::spawn(async move {
        let stage_id = core.stage_id;
        let mut inbox: Vec<StageMessage> = Vec::with_capacity(DRAIN_BATCH);
        'run: loop {
            let received = rx.recv_many(&mut inbox, DRAIN_BATCH).await;
            if received == 0 {
                break;
            }
            for msg in inbox.drain(..) {
                match std::panic::AssertUnwindSafe(core.execute(msg)).catch_unwind().await {
                    Ok(true) => {}
                    Ok(false) => break 'run,
                    Err(_) => {
                        error!(stage_id, "stage handler panicked; message discarded");
                        core.sender.set_reply_context(None);
                    }
                }
            }
        }
        // Refuse whatever raced into the mailbox behind the stop.
        rx.close();
        for msg in inbox.drain(..) {
            core.refuse(msg);
        }
        while let Ok(msg) = rx.try_recv() {
            core.refuse(msg);
        }
        core.teardown();
        warn_if_leftover(&core);
        on_exit(stage_id);
    });
    handle
}

fn warn_if_leftover(core: &StageCore) {
    if !core.actors.is_empty() {
        warn!(
            stage_id = core.stage_id,
            actors = core.actors.len(),
            "stage exited with live actors"
        );
        for account_id in core.actors.keys() {
            core.accounts.remove(account_id);
        }
    }
}
