//! Standard test content: a room that counts and echoes, a player with a
//! scriptable auth packet, and a trivial API handler.
//!
//! Auth packet convention (UTF-8):
//! - `user:<id>` — authenticate as `<id>`
//! - `rejectjoin:<id>` — authenticate, then be rejected by the stage
//! - anything else — authentication fails

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes};

use mesh_core::{SelectionPolicy, ServerType};
use ph_protocol::{BytesPacket, RoutePacket};
use stage_core::{
    Actor, ActorSender, ApiHandler, ApiSender, ContentRegistry, Stage, StageSender,
};

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Observation point shared between a test and its content instances.
#[derive(Default)]
pub struct RoomProbe {
    pub joins: AtomicU32,
    pub actor_drops: Mutex<Vec<String>>,
    pub conn_events: Mutex<Vec<(String, bool)>>,
    pub log: Mutex<Vec<String>>,
}

impl RoomProbe {
    pub fn log_snapshot(&self) -> Vec<String> {
        self.log.lock().expect("log lock").clone()
    }

    pub fn conn_snapshot(&self) -> Vec<(String, bool)> {
        self.conn_events.lock().expect("events lock").clone()
    }

    pub fn drops_snapshot(&self) -> Vec<String> {
        self.actor_drops.lock().expect("drops lock").clone()
    }
}

// ---------------------------------------------------------------------------
// CountingRoom
// ---------------------------------------------------------------------------

/// Message vocabulary:
/// - `Echo` — reply with the same payload
/// - `SlowMs` — payload u64 LE millis; sleep, then reply `late`
/// - `Ignore` — never answers (for timeout tests)
/// - `Append` — record the payload in the probe log
/// - `AskRemote` — payload `nid|stage_id|msg_id`; relay the request and
///   forward the outcome
/// - `AskService` — payload u16 LE service id; weighted request to an API
///   service, reply with the responder's answer
/// - `PushMe` — push `Pushed` to the sending actor's client, then reply
pub struct CountingRoom {
    pub sender: StageSender,
    pub probe: Arc<RoomProbe>,
}

#[async_trait]
impl Stage for CountingRoom {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    async fn on_join_stage(&mut self, actor: &mut dyn Actor) -> bool {
        let reject = actor.downcast_mut::<CountingPlayer>().is_some_and(|p| p.reject_join);
        if !reject {
            self.probe.joins.fetch_add(1, Ordering::SeqCst);
        }
        !reject
    }

    async fn on_connection_changed(&mut self, actor: &mut dyn Actor, connected: bool) {
        let account = actor
            .downcast_mut::<CountingPlayer>()
            .map(|p| p.sender.account_id())
            .unwrap_or_default();
        self.probe.conn_events.lock().expect("events lock").push((account, connected));
    }

    async fn on_dispatch(&mut self, actor: Option<&mut dyn Actor>, packet: RoutePacket) {
        match packet.msg_id.as_str() {
            "Echo" => self.sender.reply(packet.payload.clone()),
            "SlowMs" => {
                let mut buf = &packet.payload[..];
                let millis = if buf.len() >= 8 { buf.get_u64_le() } else { 100 };
                tokio::time::sleep(Duration::from_millis(millis)).await;
                self.sender.reply(Bytes::from_static(b"late"));
            }
            "Ignore" => {}
            "Append" => {
                self.probe
                    .log
                    .lock()
                    .expect("log lock")
                    .push(String::from_utf8_lossy(&packet.payload).into_owned());
            }
            "AskRemote" => {
                let target = String::from_utf8_lossy(&packet.payload).into_owned();
                let mut parts = target.splitn(3, '|');
                let (Some(nid), Some(stage), Some(msg_id)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    self.sender.reply_error(ph_protocol::error_codes::INTERNAL_ERROR);
                    return;
                };
                let stage_id: i64 = stage.parse().unwrap_or(0);
                let result = self
                    .sender
                    .request_to_stage(nid, stage_id, &BytesPacket::empty(msg_id))
                    .await;
                match result {
                    Ok(reply) => self.sender.reply(reply.payload),
                    Err(code) => self.sender.reply_error(code),
                }
            }
            "AskService" => {
                let mut buf = &packet.payload[..];
                let service_id = if buf.len() >= 2 { buf.get_u16_le() } else { 0 };
                let result = self
                    .sender
                    .request_to_service(
                        ServerType::Api,
                        service_id,
                        SelectionPolicy::Weighted,
                        &BytesPacket::empty("WhoAmI"),
                    )
                    .await;
                match result {
                    Ok(reply) => self.sender.reply(reply.payload),
                    Err(code) => self.sender.reply_error(code),
                }
            }
            "PushMe" => {
                if let Some(actor) = actor {
                    if let Some(player) = actor.downcast_mut::<CountingPlayer>() {
                        player.sender.push_to_client(&BytesPacket::new(
                            "Pushed",
                            Bytes::from_static(b"push-payload"),
                        ));
                    }
                }
                self.sender.reply(Bytes::new());
            }
            other => {
                self.probe
                    .log
                    .lock()
                    .expect("log lock")
                    .push(format!("unknown-{other}"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CountingPlayer
// ---------------------------------------------------------------------------

pub struct CountingPlayer {
    pub sender: ActorSender,
    pub probe: Arc<RoomProbe>,
    pub reject_join: bool,
}

#[async_trait]
impl Actor for CountingPlayer {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    async fn on_authenticate(&mut self, auth: Bytes) -> bool {
        let text = String::from_utf8_lossy(&auth).into_owned();
        if let Some(account) = text.strip_prefix("user:") {
            self.sender.set_account_id(account);
            return true;
        }
        if let Some(account) = text.strip_prefix("rejectjoin:") {
            self.sender.set_account_id(account);
            self.reject_join = true;
            return true;
        }
        false
    }

    async fn on_destroy(&mut self) {
        self.probe
            .actor_drops
            .lock()
            .expect("drops lock")
            .push(self.sender.account_id());
    }
}

/// A registry with the counting room registered under `stage_type "room"`.
pub fn counting_registry(probe: &Arc<RoomProbe>) -> ContentRegistry {
    let mut registry = ContentRegistry::new();
    let stage_probe = Arc::clone(probe);
    let actor_probe = Arc::clone(probe);
    registry.register(
        "room",
        move |sender| {
            Box::new(CountingRoom { sender, probe: Arc::clone(&stage_probe) })
        },
        move |sender| {
            Box::new(CountingPlayer {
                sender,
                probe: Arc::clone(&actor_probe),
                reject_join: false,
            })
        },
    );
    registry
}

// ---------------------------------------------------------------------------
// API handler
// ---------------------------------------------------------------------------

/// Replies to every request with this node's nid — service selection tests
/// count the distribution of answers.
pub struct WhoAmIHandler {
    pub nid: String,
}

#[async_trait]
impl ApiHandler for WhoAmIHandler {
    async fn handle(&self, _packet: RoutePacket, sender: ApiSender) {
        sender.reply(Bytes::from(self.nid.clone().into_bytes()));
    }
}
