//! Fleet member descriptions.

use serde::{Deserialize, Serialize};

/// Role class of a fleet member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerType {
    Play,
    Api,
    Other,
}

/// Operational state reported by discovery.
///
/// `Paused` members keep their links but are excluded from selection;
/// `Disabled` members are disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Running,
    Disabled,
    Paused,
}

/// One server as seen by discovery.
///
/// `server_id` is the unique stable identity; `nid` is the short id used on
/// the wire. Two servers sharing a `service_id` are interchangeable at the
/// service level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub nid: String,
    pub service_id: u16,
    pub server_type: ServerType,
    /// `host:port` of the server's mesh listener.
    pub address: String,
    pub state: ServerState,
    pub weight: u16,
    /// Epoch millis of the last discovery heartbeat.
    #[serde(default)]
    pub last_heartbeat: i64,
}

impl ServerInfo {
    pub fn is_running(&self) -> bool {
        self.state == ServerState::Running
    }

    /// Eligible for service selection: running with a positive weight.
    pub fn is_selectable(&self) -> bool {
        self.is_running() && self.weight > 0
    }

    /// The fields whose change makes a snapshot entry `Updated`.
    /// `last_heartbeat` churns every cycle and is deliberately excluded.
    pub(crate) fn identity_tuple(&self) -> (&str, ServerState, u16, u16, ServerType) {
        (&self.address, self.state, self.weight, self.service_id, self.server_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn server(id: &str, state: ServerState, weight: u16) -> ServerInfo {
        ServerInfo {
            server_id: id.to_owned(),
            nid: format!("n-{id}"),
            service_id: 1,
            server_type: ServerType::Play,
            address: format!("127.0.0.1:{}", 7000),
            state,
            weight,
            last_heartbeat: 0,
        }
    }

    #[test]
    fn selectable_requires_running_and_weight() {
        assert!(server("a", ServerState::Running, 1).is_selectable());
        assert!(!server("a", ServerState::Running, 0).is_selectable());
        assert!(!server("a", ServerState::Paused, 5).is_selectable());
        assert!(!server("a", ServerState::Disabled, 5).is_selectable());
    }

    #[test]
    fn heartbeat_is_not_part_of_the_identity_tuple() {
        let mut a = server("a", ServerState::Running, 1);
        let mut b = a.clone();
        a.last_heartbeat = 10;
        b.last_heartbeat = 99;
        assert_eq!(a.identity_tuple(), b.identity_tuple());
    }

    #[test]
    fn fleet_snapshot_deserializes_from_json() {
        let json = r#"[{
            "server_id": "play-1", "nid": "p1", "service_id": 2,
            "server_type": "play", "address": "10.0.0.5:16000",
            "state": "running", "weight": 3
        }]"#;
        let fleet: Vec<ServerInfo> = serde_json::from_str(json).expect("parse");
        assert_eq!(fleet[0].server_type, ServerType::Play);
        assert_eq!(fleet[0].last_heartbeat, 0);
    }
}
