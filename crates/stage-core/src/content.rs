//! Content extension points.
//!
//! Framework and content meet at two trait objects: a `Stage` (the room /
//! match / session state) and its `Actor`s (authenticated participants).
//! Content registers one factory pair per `stage_type`; the dispatcher
//! instantiates through the registry and drives the callbacks from the
//! stage's own loop, so implementations never need internal locking.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use ph_protocol::RoutePacket;

use crate::sender::{ActorSender, StageSender};

// ---------------------------------------------------------------------------
// Client endpoint
// ---------------------------------------------------------------------------

/// Where an actor's client lives: the node holding its socket, the session
/// id on that node, and the API node that brokered the join (empty when the
/// client joined directly).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientEndpoint {
    pub session_nid: String,
    pub sid: i64,
    pub api_nid: String,
}

/// Shared identity record for one actor. The framework and the actor's
/// `ActorSender` hold the same `ActorLink`, so a reconnect updates the
/// endpoint triple in place — the content instance is never replaced.
#[derive(Debug, Default)]
pub struct ActorLink {
    account_id: Mutex<String>,
    endpoint: Mutex<ClientEndpoint>,
}

impl ActorLink {
    pub fn new(endpoint: ClientEndpoint) -> Self {
        ActorLink { account_id: Mutex::new(String::new()), endpoint: Mutex::new(endpoint) }
    }

    pub fn account_id(&self) -> String {
        self.account_id.lock().expect("link lock").clone()
    }

    /// Set during authentication; must be non-empty for the join to proceed.
    pub fn set_account_id(&self, account_id: impl Into<String>) {
        *self.account_id.lock().expect("link lock") = account_id.into();
    }

    pub fn endpoint(&self) -> ClientEndpoint {
        self.endpoint.lock().expect("link lock").clone()
    }

    pub fn set_endpoint(&self, endpoint: ClientEndpoint) {
        *self.endpoint.lock().expect("link lock") = endpoint;
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// A stateful unit of work owned by one event loop.
///
/// All callbacks run on the stage's loop; `&mut self` is exclusive for the
/// whole callback, awaits included. Returning `false` from `on_create` or
/// `on_join_stage` rejects the operation with the matching error code.
#[async_trait]
pub trait Stage: Send + 'static {
    /// Escape hatch for closures (timers, async blocks) that need the
    /// concrete type back: `stage.as_any_mut().downcast_mut::<MyRoom>()`.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    async fn on_create(&mut self, payload: Bytes) -> bool {
        let _ = payload;
        true
    }

    async fn on_post_create(&mut self) {}

    async fn on_destroy(&mut self) {}

    async fn on_join_stage(&mut self, actor: &mut dyn Actor) -> bool {
        let _ = actor;
        true
    }

    async fn on_post_join_stage(&mut self, actor: &mut dyn Actor) {
        let _ = actor;
    }

    /// Connection state of an existing actor changed: `true` on reconnect,
    /// `false` when the client's connection dropped.
    async fn on_connection_changed(&mut self, actor: &mut dyn Actor, connected: bool) {
        let _ = (actor, connected);
    }

    /// A routed message for this stage: `actor` is the sending client's
    /// actor, or `None` for server-to-stage traffic.
    async fn on_dispatch(&mut self, actor: Option<&mut dyn Actor>, packet: RoutePacket);
}

impl dyn Stage {
    pub fn downcast_mut<T: Stage>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut()
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// An authenticated participant bound to exactly one stage.
#[async_trait]
pub trait Actor: Send + 'static {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    async fn on_create(&mut self) {}

    async fn on_destroy(&mut self) {}

    /// Validate the opaque auth packet. Implementations set the account id
    /// through their `ActorSender` before returning `true`.
    async fn on_authenticate(&mut self, auth: Bytes) -> bool;

    async fn on_post_authenticate(&mut self) {}
}

impl dyn Actor {
    pub fn downcast_mut<T: Actor>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut()
    }
}

// ---------------------------------------------------------------------------
// Factory registry
// ---------------------------------------------------------------------------

pub type StageFactory = Box<dyn Fn(StageSender) -> Box<dyn Stage> + Send + Sync>;
pub type ActorFactory = Box<dyn Fn(ActorSender) -> Box<dyn Actor> + Send + Sync>;

/// The `stage_type → factories` table. Populated once at startup, read on
/// every create/join.
#[derive(Default)]
pub struct ContentRegistry {
    stages: HashMap<String, StageFactory>,
    actors: HashMap<String, ActorFactory>,
}

impl ContentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory pair for `stage_type`, replacing any previous
    /// registration.
    pub fn register(
        &mut self,
        stage_type: impl Into<String>,
        stage: impl Fn(StageSender) -> Box<dyn Stage> + Send + Sync + 'static,
        actor: impl Fn(ActorSender) -> Box<dyn Actor> + Send + Sync + 'static,
    ) {
        let stage_type = stage_type.into();
        self.stages.insert(stage_type.clone(), Box::new(stage));
        self.actors.insert(stage_type, Box::new(actor));
    }

    pub fn has_type(&self, stage_type: &str) -> bool {
        self.stages.contains_key(stage_type)
    }

    pub fn create_stage(&self, stage_type: &str, sender: StageSender) -> Option<Box<dyn Stage>> {
        self.stages.get(stage_type).map(|f| f(sender))
    }

    pub fn create_actor(&self, stage_type: &str, sender: ActorSender) -> Option<Box<dyn Actor>> {
        self.actors.get(stage_type).map(|f| f(sender))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_updates_the_link_in_place() {
        let link = ActorLink::new(ClientEndpoint {
            session_nid: "play-1".to_owned(),
            sid: 10,
            api_nid: String::new(),
        });
        link.set_account_id("u1");
        link.set_endpoint(ClientEndpoint {
            session_nid: "play-1".to_owned(),
            sid: 99,
            api_nid: String::new(),
        });
        assert_eq!(link.account_id(), "u1");
        assert_eq!(link.endpoint().sid, 99);
    }
}
