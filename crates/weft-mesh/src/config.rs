//! Router configuration.
//!
//! Configuration for a weft router, including:
//! - Peer identity (name and nickname)
//! - Listening address and port, shared by TCP and the UDP overlay
//! - Encryption password and trusted subnets
//! - Connection limit, peer discovery and initial peers

use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::peer::PeerName;
use crate::protocol::{PROTOCOL_MAX_VERSION, PROTOCOL_MIN_VERSION};

/// Default port for both TCP and UDP.
pub const DEFAULT_PORT: u16 = 6783;

/// Default maximum number of connections.
pub const DEFAULT_CONN_LIMIT: usize = 30;

/// Which overlay carries frames between peers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverlayKind {
    /// UDP encapsulation.
    #[default]
    Sleeve,
    /// No data plane; control traffic only.
    None,
}

/// Main router configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RouterConfig {
    /// Peer name; a random one is generated when absent.
    pub name: Option<PeerName>,
    /// Human-readable nickname.
    pub nick_name: String,
    /// Address to listen on.
    pub bind_address: IpAddr,
    /// Port for TCP connections and UDP datagrams; 0 picks a free port.
    pub port: u16,
    /// Oldest protocol version to accept.
    pub protocol_min_version: u8,
    /// Shared password; connections are encrypted when set.
    pub password: Option<String>,
    /// Subnets whose peers may skip overlay encryption.
    pub trusted_subnets: Vec<IpNet>,
    /// Maximum number of connections; 0 means unlimited.
    pub conn_limit: usize,
    /// Whether to connect to peers learned through gossip.
    pub peer_discovery: bool,
    /// Peers to connect to at startup, as `host` or `host:port`.
    pub peers: Vec<String>,
    /// Overlay used for the data plane.
    pub overlay: OverlayKind,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: None,
            nick_name: default_nick_name(),
            bind_address: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            protocol_min_version: PROTOCOL_MIN_VERSION,
            password: None,
            trusted_subnets: Vec::new(),
            conn_limit: DEFAULT_CONN_LIMIT,
            peer_discovery: true,
            peers: Vec::new(),
            overlay: OverlayKind::default(),
        }
    }
}

fn default_nick_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "weft".to_string())
}

impl RouterConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            MeshError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self, MeshError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| MeshError::Config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, MeshError> {
        serde_json::to_string_pretty(self).map_err(|e| MeshError::Config(e.to_string()))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.name.is_some_and(|n| n.is_unknown()) {
            return Err(MeshError::Config(
                "name cannot be 00:00:00:00:00:00".to_string(),
            ));
        }

        if !(PROTOCOL_MIN_VERSION..=PROTOCOL_MAX_VERSION).contains(&self.protocol_min_version) {
            return Err(MeshError::Config(format!(
                "protocol_min_version must be between {PROTOCOL_MIN_VERSION} and {PROTOCOL_MAX_VERSION}"
            )));
        }

        if self.password.as_deref().is_some_and(str::is_empty) {
            return Err(MeshError::Config("password cannot be empty".to_string()));
        }

        if let Some(peer) = self.peers.iter().find(|p| p.trim().is_empty()) {
            return Err(MeshError::Config(format!("invalid peer address '{peer}'")));
        }

        Ok(())
    }

    /// Returns the password bytes, if a password is set.
    #[must_use]
    pub fn password_bytes(&self) -> Option<Vec<u8>> {
        self.password.as_ref().map(|p| p.as_bytes().to_vec())
    }

    /// Returns true if `ip` lies in one of the trusted subnets.
    #[must_use]
    pub fn trusts(&self, ip: IpAddr) -> bool {
        self.trusted_subnets.iter().any(|net| net.contains(&ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use test_case::test_case;

    // Helper to create a temporary config file
    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("failed to write temp file");
        file
    }

    // ========== Parsing Tests ==========

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = RouterConfig::from_json("{}").expect("should parse");

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.conn_limit, DEFAULT_CONN_LIMIT);
        assert_eq!(config.protocol_min_version, 1);
        assert!(config.peer_discovery);
        assert!(config.name.is_none());
        assert_eq!(config.overlay, OverlayKind::Sleeve);
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "name": "aa:bb:cc:dd:ee:01",
            "nick_name": "edge-1",
            "bind_address": "10.0.0.1",
            "port": 7000,
            "protocol_min_version": 2,
            "password": "hunter2",
            "trusted_subnets": ["10.0.0.0/8", "fd00::/8"],
            "conn_limit": 0,
            "peer_discovery": false,
            "peers": ["10.0.0.2", "10.0.0.3:7000"],
            "overlay": "none"
        }"#;

        let config = RouterConfig::from_json(json).expect("should parse");

        assert_eq!(
            config.name.map(|n| n.to_string()).as_deref(),
            Some("aa:bb:cc:dd:ee:01")
        );
        assert_eq!(config.nick_name, "edge-1");
        assert_eq!(config.port, 7000);
        assert_eq!(config.password_bytes(), Some(b"hunter2".to_vec()));
        assert_eq!(config.trusted_subnets.len(), 2);
        assert_eq!(config.conn_limit, 0);
        assert!(!config.peer_discovery);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.overlay, OverlayKind::None);
    }

    #[test]
    fn test_default_round_trips_through_json() {
        let config = RouterConfig::default();
        let json = config.to_json().expect("serialize");
        assert_eq!(RouterConfig::from_json(&json).expect("parse"), config);
    }

    #[test]
    fn test_from_file() {
        let file = create_temp_config(r#"{"port": 6800, "peers": ["192.168.1.5"]}"#);
        let config = RouterConfig::from_file(file.path()).expect("should load");
        assert_eq!(config.port, 6800);
        assert_eq!(config.peers, vec!["192.168.1.5".to_string()]);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = RouterConfig::from_file("/nonexistent/weft.json").expect_err("missing");
        assert!(matches!(err, MeshError::Config(msg) if msg.contains("failed to read")));
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        assert!(matches!(
            RouterConfig::from_json("{ not json"),
            Err(MeshError::Config(_))
        ));
    }

    // ========== Validation Tests ==========

    #[test_case(r#"{"protocol_min_version": 0}"# ; "version too low")]
    #[test_case(r#"{"protocol_min_version": 3}"# ; "version too high")]
    #[test_case(r#"{"password": ""}"# ; "empty password")]
    #[test_case(r#"{"peers": ["  "]}"# ; "blank peer")]
    #[test_case(r#"{"name": "00:00:00:00:00:00"}"# ; "unknown name")]
    fn test_invalid_config_is_rejected(json: &str) {
        assert!(matches!(
            RouterConfig::from_json(json),
            Err(MeshError::Config(_))
        ));
    }

    #[test]
    fn test_bad_subnet_is_rejected() {
        assert!(RouterConfig::from_json(r#"{"trusted_subnets": ["10.0.0.0/99"]}"#).is_err());
    }

    #[test]
    fn test_zero_port_is_ephemeral() {
        let config = RouterConfig::from_json(r#"{"port": 0}"#).expect("port 0 allowed");
        assert_eq!(config.port, 0);
    }

    // ========== Trust Tests ==========

    #[test_case("10.1.2.3", true ; "inside v4 subnet")]
    #[test_case("192.168.0.1", false ; "outside v4 subnet")]
    #[test_case("fd00::1", true ; "inside v6 subnet")]
    fn test_trusts(ip: &str, expected: bool) {
        let config = RouterConfig {
            trusted_subnets: vec![
                "10.0.0.0/8".parse().expect("net"),
                "fd00::/8".parse().expect("net"),
            ],
            ..RouterConfig::default()
        };
        assert_eq!(config.trusts(ip.parse().expect("ip")), expected);
    }
}
