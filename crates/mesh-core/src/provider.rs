//! Discovery providers.
//!
//! The resolver only knows the `FleetProvider` trait; deployments plug in
//! whatever discovery they run. Two implementations ship here: a scripted
//! in-memory fleet for tests and tools, and a JSON snapshot file re-read on
//! every cycle.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::info::ServerInfo;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum FleetError {
    Io(String),
    Parse(String),
}

impl std::fmt::Display for FleetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FleetError::Io(s) => write!(f, "fleet fetch IO error: {}", s),
            FleetError::Parse(s) => write!(f, "fleet parse error: {}", s),
        }
    }
}

impl std::error::Error for FleetError {}

// ---------------------------------------------------------------------------
// FleetProvider
// ---------------------------------------------------------------------------

/// The discovery hook: return the current fleet, including (or omitting)
/// the calling node itself — the resolver skips `me` either way.
#[async_trait]
pub trait FleetProvider: Send + Sync {
    async fn fetch(&self, me: &ServerInfo) -> Result<Vec<ServerInfo>, FleetError>;
}

// ---------------------------------------------------------------------------
// StaticFleet
// ---------------------------------------------------------------------------

/// A programmable fleet: tests and tools mutate it between resolver cycles.
#[derive(Default)]
pub struct StaticFleet {
    servers: Mutex<Vec<ServerInfo>>,
}

impl StaticFleet {
    pub fn new(servers: Vec<ServerInfo>) -> Self {
        StaticFleet { servers: Mutex::new(servers) }
    }

    /// Replace the fleet the next fetch will observe.
    pub fn set(&self, servers: Vec<ServerInfo>) {
        *self.servers.lock().expect("fleet lock") = servers;
    }
}

#[async_trait]
impl FleetProvider for StaticFleet {
    async fn fetch(&self, _me: &ServerInfo) -> Result<Vec<ServerInfo>, FleetError> {
        Ok(self.servers.lock().expect("fleet lock").clone())
    }
}

// ---------------------------------------------------------------------------
// FleetFile
// ---------------------------------------------------------------------------

/// A JSON array of [`ServerInfo`] on disk, re-read every refresh. The
/// operational baseline when no discovery service is wired in.
pub struct FleetFile {
    path: PathBuf,
}

impl FleetFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FleetFile { path: path.into() }
    }
}

#[async_trait]
impl FleetProvider for FleetFile {
    async fn fetch(&self, _me: &ServerInfo) -> Result<Vec<ServerInfo>, FleetError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| FleetError::Io(format!("reading {}: {}", self.path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| FleetError::Parse(format!("{}: {}", self.path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{ServerState, ServerType};
    use std::io::Write;

    fn me() -> ServerInfo {
        ServerInfo {
            server_id: "play-1".to_owned(),
            nid: "p1".to_owned(),
            service_id: 1,
            server_type: ServerType::Play,
            address: "127.0.0.1:1".to_owned(),
            state: ServerState::Running,
            weight: 1,
            last_heartbeat: 0,
        }
    }

    #[tokio::test]
    async fn static_fleet_reflects_the_latest_set() {
        let fleet = StaticFleet::default();
        assert!(fleet.fetch(&me()).await.expect("fetch").is_empty());
        fleet.set(vec![me()]);
        assert_eq!(fleet.fetch(&me()).await.expect("fetch").len(), 1);
    }

    #[tokio::test]
    async fn fleet_file_parses_a_json_snapshot() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"[{{"server_id":"api-1","nid":"a1","service_id":5,"server_type":"api",
                 "address":"127.0.0.1:16001","state":"running","weight":3}}]"#
        )
        .expect("write");

        let provider = FleetFile::new(file.path());
        let fleet = provider.fetch(&me()).await.expect("fetch");
        assert_eq!(fleet.len(), 1);
        assert_eq!(fleet[0].server_id, "api-1");
    }

    #[tokio::test]
    async fn fleet_file_surfaces_missing_file_and_bad_json() {
        let provider = FleetFile::new("/nonexistent/fleet.json");
        assert!(matches!(provider.fetch(&me()).await, Err(FleetError::Io(_))));

        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "{{not json").expect("write");
        let provider = FleetFile::new(file.path());
        assert!(matches!(provider.fetch(&me()).await, Err(FleetError::Parse(_))));
    }
}
