//! Built-in sample room: enough content to boot a node end to end and
//! smoke-test a deployment. Echoes requests, broadcasts chat lines.

use async_trait::async_trait;
use bytes::Bytes;

use ph_protocol::{BytesPacket, RoutePacket};
use stage_core::{Actor, ActorSender, ClientEndpoint, ContentRegistry, Stage, StageSender};

pub struct SampleRoom {
    sender: StageSender,
    members: Vec<ClientEndpoint>,
}

#[async_trait]
impl Stage for SampleRoom {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    async fn on_post_join_stage(&mut self, actor: &mut dyn Actor) {
        if let Some(member) = actor.downcast_mut::<SampleActor>() {
            self.members.push(member.sender.endpoint());
        }
    }

    async fn on_dispatch(&mut self, _actor: Option<&mut dyn Actor>, packet: RoutePacket) {
        match packet.msg_id.as_str() {
            "Echo" => self.sender.reply(packet.payload.clone()),
            "Chat" => {
                let line = BytesPacket::new("ChatLine", packet.payload.clone());
                for member in &self.members {
                    self.sender.send_to_client(member, &line);
                }
                self.sender.reply(Bytes::new());
            }
            _ => self.sender.reply_error(ph_protocol::error_codes::INTERNAL_ERROR),
        }
    }
}

pub struct SampleActor {
    sender: ActorSender,
}

#[async_trait]
impl Actor for SampleActor {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    /// The auth packet is the account id itself; empty means unauthenticated.
    async fn on_authenticate(&mut self, auth: Bytes) -> bool {
        match std::str::from_utf8(&auth) {
            Ok(account) if !account.is_empty() => {
                self.sender.set_account_id(account);
                true
            }
            _ => false,
        }
    }
}

/// Registry with the sample room under `stage_type "room"`.
pub fn sample_registry() -> ContentRegistry {
    let mut registry = ContentRegistry::new();
    registry.register(
        "room",
        |sender| Box::new(SampleRoom { sender, members: Vec::new() }) as Box<dyn Stage>,
        |sender| Box::new(SampleActor { sender }) as Box<dyn Actor>,
    );
    registry
}
