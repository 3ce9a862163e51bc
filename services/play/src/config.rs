//! Play node configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `node.server_id`, `node.nid`, `node.service_id`
//! - `mesh.bind`
//! - `discovery.fleet_file`
//! - at least one transport bind (`transport.tcp_bind` or
//!   `transport.ws_bind`)
//!
//! Everything else defaults to the documented values (64 KiB buffers,
//! 2 MiB max packet, 90 s heartbeat, 30 s request timeout, 3 s refresh).

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PlayConfig {
    pub schema_version: u32,
    pub node: NodeConfig,
    pub transport: TransportSection,
    pub mesh: MeshConfig,
    pub discovery: DiscoveryConfig,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub server_id: String,
    pub nid: String,
    pub service_id: u16,
}

#[derive(Debug, Clone)]
pub struct TransportSection {
    pub tcp_bind: Option<String>,
    pub ws_bind: Option<String>,
    pub ws_path: String,
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    pub pause_writer_threshold: usize,
    pub resume_writer_threshold: usize,
    pub max_packet_size: u32,
    pub heartbeat_timeout: Duration,
    pub tcp_keepalive: bool,
    pub tls: TlsConfig,
}

/// Recognized and validated, but terminated upstream of the core: sessions
/// accept an already-negotiated byte stream.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub certificate: Option<String>,
    pub private_key: Option<String>,
    pub require_client_certificate: bool,
    pub check_certificate_revocation: bool,
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub bind: String,
    /// Address other nodes dial; defaults to `bind`.
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
    transport: Option<RawTransport>,
    mesh: Option<RawMesh>,
    discovery: Option<RawDiscovery>,
    requests: Option<RawRequests>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    server_id: Option<String>,
    nid: Option<String>,
    service_id: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawTransport {
    tcp_bind: Option<String>,
    ws_bind: Option<String>,
    ws_path: Option<String>,
    receive_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
    pause_writer_threshold: Option<usize>,
    resume_writer_threshold: Option<usize>,
    max_packet_size: Option<u32>,
    heartbeat_timeout_secs: Option<u64>,
    tcp_keepalive: Option<bool>,
    tls: Option<RawTls>,
}

#[derive(Debug, Deserialize)]
struct RawTls {
    enabled: Option<bool>,
    certificate: Option<String>,
    private_key: Option<String>,
    require_client_certificate: Option<bool>,
    check_certificate_revocation: Option<bool>,
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

pub fn load_config_from_path(path: &Path) -> Result<PlayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<PlayConfig, ConfigError> {
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
    };
    if node.nid.is_empty() || node.nid.len() > 255 {
        return Err(ConfigError::InvalidValue("node.nid must be 1-255 bytes".to_owned()));
    }

    let raw_transport =
        raw.transport.ok_or_else(|| ConfigError::MissingField("transport".to_owned()))?;
    let tls = match raw_transport.tls {
        Some(t) => TlsConfig {
            enabled: t.enabled.unwrap_or(false),
            certificate: t.certificate,
            private_key: t.private_key,
            require_client_certificate: t.require_client_certificate.unwrap_or(false),
            check_certificate_revocation: t.check_certificate_revocation.unwrap_or(false),
        },
        None => TlsConfig::default(),
    };
    if tls.enabled && (tls.certificate.is_none() || tls.private_key.is_none()) {
        return Err(ConfigError::InvalidValue(
            "transport.tls.enabled requires certificate and private_key".to_owned(),
        ));
    }
    let pause_writer_threshold = raw_transport.pause_writer_threshold.unwrap_or(256 * 1024);
    let resume_writer_threshold = raw_transport.resume_writer_threshold.unwrap_or(64 * 1024);
    if resume_writer_threshold > pause_writer_threshold {
        return Err(ConfigError::InvalidValue(
            "resume_writer_threshold must not exceed pause_writer_threshold".to_owned(),
        ));
    }
    let transport = TransportSection {
        tcp_bind: raw_transport.tcp_bind,
        ws_bind: raw_transport.ws_bind,
        ws_path: raw_transport.ws_path.unwrap_or_else(|| "/ws".to_owned()),
        receive_buffer_size: raw_transport.receive_buffer_size.unwrap_or(64 * 1024),
        send_buffer_size: raw_transport.send_buffer_size.unwrap_or(64 * 1024),
        pause_writer_threshold,
        resume_writer_threshold,
        max_packet_size: raw_transport.max_packet_size.unwrap_or(2 * 1024 * 1024),
        heartbeat_timeout: Duration::from_secs(raw_transport.heartbeat_timeout_secs.unwrap_or(90)),
        tcp_keepalive: raw_transport.tcp_keepalive.unwrap_or(false),
        tls,
    };
    if transport.tcp_bind.is_none() && transport.ws_bind.is_none() {
        return Err(ConfigError::InvalidValue(
            "at least one of transport.tcp_bind / transport.ws_bind is required".to_owned(),
        ));
    }

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

    let request_timeout = Duration::from_millis(
        raw.requests.and_then(|r| r.request_timeout_ms).unwrap_or(30_000),
    );

    Ok(PlayConfig { schema_version, node, transport, mesh, discovery, request_timeout })
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

    const MINIMAL: &str = r#"
        schema_version = 1

        [node]
        server_id = "play-1"
        nid = "p1"
        service_id = 2

        [transport]
        tcp_bind = "0.0.0.0:15000"

        [mesh]
        bind = "0.0.0.0:16000"

        [discovery]
        fleet_file = "/etc/playhouse/fleet.json"
    "#;

    #[test]
    fn minimal_config_gets_the_documented_defaults() {
        let cfg = load_config_from_str(MINIMAL).expect("parse");
        assert_eq!(cfg.node.server_id, "play-1");
        assert_eq!(cfg.transport.receive_buffer_size, 64 * 1024);
        assert_eq!(cfg.transport.send_buffer_size, 64 * 1024);
        assert_eq!(cfg.transport.max_packet_size, 2 * 1024 * 1024);
        assert_eq!(cfg.transport.heartbeat_timeout, Duration::from_secs(90));
        assert_eq!(cfg.transport.ws_path, "/ws");
        assert_eq!(cfg.request_timeout, Duration::from_millis(30_000));
        assert_eq!(cfg.discovery.refresh_interval, Duration::from_secs(3));
        assert_eq!(cfg.mesh.advertise, "0.0.0.0:16000");
        assert!(!cfg.transport.tls.enabled);
    }

    #[test]
    fn missing_sections_are_named_in_the_error() {
        let err = load_config_from_str("schema_version = 1").expect_err("must fail");
        assert!(matches!(err, ConfigError::MissingField(ref f) if f == "node"), "{err}");
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let bad = MINIMAL.replace("schema_version = 1", "schema_version = 2");
        assert!(matches!(
            load_config_from_str(&bad),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn no_transport_bind_is_rejected() {
        let bad = MINIMAL.replace("tcp_bind = \"0.0.0.0:15000\"", "ws_path = \"/ws\"");
        assert!(matches!(load_config_from_str(&bad), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn tls_requires_certificate_material() {
        let bad = format!("{MINIMAL}\n[transport.tls]\nenabled = true\n");
        assert!(matches!(load_config_from_str(&bad), Err(ConfigError::InvalidValue(_))));

        let good = format!(
            "{MINIMAL}\n[transport.tls]\nenabled = true\ncertificate = \"/c.pem\"\nprivate_key = \"/k.pem\"\n"
        );
        let cfg = load_config_from_str(&good).expect("parse");
        assert!(cfg.transport.tls.enabled);
    }

    #[test]
    fn backpressure_thresholds_must_be_ordered() {
        let bad = format!(
            "{}\n",
            MINIMAL.replace(
                "tcp_bind = \"0.0.0.0:15000\"",
                "tcp_bind = \"0.0.0.0:15000\"\npause_writer_threshold = 100\nresume_writer_threshold = 200"
            )
        );
        assert!(matches!(load_config_from_str(&bad), Err(ConfigError::InvalidValue(_))));
    }
}
