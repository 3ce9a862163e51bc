//! API node configuration loading. Same TOML conventions as the play node,
//! minus the client transport section (API nodes face the mesh only).

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub schema_version: u32,
    pub node: NodeConfig,
    pub mesh: MeshConfig,
    pub discovery: DiscoveryConfig,
    pub request_timeout: Duration,
    pub max_packet_size: u32,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub server_id: String,
    pub nid: String,
    pub service_id: u16,
    pub weight: u16,
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub bind: String,
    pub advertise: String,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub fleet_file: String,
    pub refresh_interval: Duration,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    node: Option<RawNode>,
    mesh: Option<RawMesh>,
    discovery: Option<RawDiscovery>,
    requests: Option<RawRequests>,
    max_packet_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    server_id: Option<String>,
    nid: Option<String>,
    service_id: Option<u16>,
    weight: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawMesh {
    bind: Option<String>,
    advertise: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDiscovery {
    fleet_file: Option<String>,
    refresh_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawRequests {
    request_timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<ApiConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<ApiConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let raw_node = raw.node.ok_or_else(|| ConfigError::MissingField("node".to_owned()))?;
    let node = NodeConfig {
        server_id: raw_node
            .server_id
            .ok_or_else(|| ConfigError::MissingField("node.server_id".to_owned()))?,
        nid: raw_node.nid.ok_or_else(|| ConfigError::MissingField("node.nid".to_owned()))?,
        service_id: raw_node
            .service_id
            .ok_or_else(|| ConfigError::MissingField("node.service_id".to_owned()))?,
        weight: raw_node.weight.unwrap_or(1),
    };

    let raw_mesh = raw.mesh.ok_or_else(|| ConfigError::MissingField("mesh".to_owned()))?;
    let bind = raw_mesh.bind.ok_or_else(|| ConfigError::MissingField("mesh.bind".to_owned()))?;
    let mesh = MeshConfig { advertise: raw_mesh.advertise.unwrap_or_else(|| bind.clone()), bind };

    let raw_discovery =
        raw.discovery.ok_or_else(|| ConfigError::MissingField("discovery".to_owned()))?;
    let discovery = DiscoveryConfig {
        fleet_file: raw_discovery
            .fleet_file
            .ok_or_else(|| ConfigError::MissingField("discovery.fleet_file".to_owned()))?,
        refresh_interval: Duration::from_secs(raw_discovery.refresh_interval_secs.unwrap_or(3)),
    };

    Ok(ApiConfig {
        schema_version,
        node,
        mesh,
        discovery,
        request_timeout: Duration::from_millis(
            raw.requests.and_then(|r| r.request_timeout_ms).unwrap_or(30_000),
        ),
        max_packet_size: raw.max_packet_size.unwrap_or(2 * 1024 * 1024),
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg = load_config_from_str(
            r#"
            schema_version = 1

            [node]
            server_id = "api-1"
            nid = "a1"
            service_id = 5

            [mesh]
            bind = "0.0.0.0:16100"

            [discovery]
            fleet_file = "/etc/playhouse/fleet.json"
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.node.weight, 1);
        assert_eq!(cfg.request_timeout, Duration::from_millis(30_000));
        assert_eq!(cfg.mesh.advertise, "0.0.0.0:16100");
    }
}
