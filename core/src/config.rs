// Node configuration
//
// Stored as JSON. Every field has a default so a partial file (or no file at
// all) is a valid configuration.

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::discovery::bootstrap::DEFAULT_BOOTSTRAP_PEERS;

/// Default location of the identity key file (relative to the working directory)
pub const DEFAULT_IDENTITY_PATH: &str = "whoosh_identity.key";

/// Address advertised in addition to the listen addresses, for a node
/// running behind a static port-forward
pub const DEFAULT_PUBLIC_ADDR: &str = "/ip4/13.235.69.64/tcp/4002/ws";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid multiaddr in {field}: {value} ({reason})")]
    InvalidAddress {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("Invalid connection manager settings: {0}")]
    InvalidConnectionManager(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Path of the identity key file
    pub identity_path: PathBuf,

    /// Endpoints to listen on and the optional advertised override
    pub listen: ListenConfig,

    /// Well-known seed peers dialed once at startup
    pub bootstrap_peers: Vec<String>,

    /// Enable mDNS for local network discovery
    pub enable_mdns: bool,

    /// Interval between mDNS queries, in seconds
    pub mdns_query_interval_secs: u64,

    /// Enable the Kademlia DHT for wide area discovery
    pub enable_dht: bool,

    /// Connection pressure relief settings
    pub connection_manager: ConnectionManagerConfig,

    /// Deadline for a single connection attempt, in seconds
    pub dial_timeout_secs: u64,

    /// Deadline for the first greeting read on a handshake stream, in seconds
    pub greeting_timeout_secs: u64,

    /// Connections with no open streams are closed after this many seconds
    pub idle_connection_timeout_secs: u64,

    /// Upper bound on concurrent discovery-triggered dials (`None` = unbounded)
    pub max_concurrent_discovery_dials: Option<usize>,

    /// Name sent in outbound greetings
    pub device_name: String,
}

/// Listener configuration: the endpoints the node accepts connections on
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub addrs: Vec<String>,
    pub public_addr: Option<String>,
}

/// Watermarks and grace period for the admission controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionManagerConfig {
    pub low_water: usize,
    pub high_water: usize,
    pub grace_period_secs: u64,
    /// How often the swarm re-checks connection pressure, in seconds
    pub trim_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity_path: PathBuf::from(DEFAULT_IDENTITY_PATH),
            listen: ListenConfig::default(),
            bootstrap_peers: DEFAULT_BOOTSTRAP_PEERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            enable_mdns: true,
            mdns_query_interval_secs: 5,
            enable_dht: true,
            connection_manager: ConnectionManagerConfig::default(),
            dial_timeout_secs: 30,
            greeting_timeout_secs: 30,
            idle_connection_timeout_secs: 300,
            max_concurrent_discovery_dials: Some(64),
            device_name: "whoosh-node".to_string(),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addrs: vec![
                "/ip4/0.0.0.0/tcp/0".to_string(),
                "/ip4/0.0.0.0/udp/0/quic-v1".to_string(),
                "/ip4/0.0.0.0/tcp/4002/ws".to_string(),
            ],
            public_addr: Some(DEFAULT_PUBLIC_ADDR.to_string()),
        }
    }
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            low_water: 100,
            high_water: 400,
            grace_period_secs: 60,
            trim_interval_secs: 60,
        }
    }
}

impl ListenConfig {
    /// Parse the listen addresses
    pub fn multiaddrs(&self) -> Result<Vec<Multiaddr>, ConfigError> {
        self.addrs
            .iter()
            .map(|addr| parse_multiaddr("listen.addrs", addr))
            .collect()
    }

    /// Parse the advertised address override, if any
    pub fn public_multiaddr(&self) -> Result<Option<Multiaddr>, ConfigError> {
        self.public_addr
            .as_deref()
            .map(|addr| parse_multiaddr("listen.public_addr", addr))
            .transpose()
    }
}

impl ConnectionManagerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn trim_interval(&self) -> Duration {
        Duration::from_secs(self.trim_interval_secs.max(1))
    }
}

impl NodeConfig {
    /// Load config from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        Self::from_json(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Check the listen addresses and the watermarks up front so a bad value
    /// is a startup failure. Seed entries are not checked here: a bad seed is
    /// skipped by the bootstrap pass.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen.multiaddrs()?;
        self.listen.public_multiaddr()?;
        let cm = &self.connection_manager;
        if cm.low_water >= cm.high_water {
            return Err(ConfigError::InvalidConnectionManager(format!(
                "low water mark ({}) must be below high water mark ({})",
                cm.low_water, cm.high_water
            )));
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn greeting_timeout(&self) -> Duration {
        Duration::from_secs(self.greeting_timeout_secs)
    }

    pub fn idle_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_connection_timeout_secs)
    }

    pub fn mdns_query_interval(&self) -> Duration {
        Duration::from_secs(self.mdns_query_interval_secs.max(1))
    }
}

fn parse_multiaddr(field: &'static str, value: &str) -> Result<Multiaddr, ConfigError> {
    value.parse().map_err(|e: libp2p::multiaddr::Error| ConfigError::InvalidAddress {
        field,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.identity_path, PathBuf::from("whoosh_identity.key"));
        assert_eq!(config.listen.addrs.len(), 3);
        assert_eq!(config.connection_manager.low_water, 100);
        assert_eq!(config.connection_manager.high_water, 400);
        assert_eq!(config.connection_manager.grace_period(), Duration::from_secs(60));
        assert!(config.enable_mdns);
        assert!(config.enable_dht);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_serialization() {
        let config = NodeConfig::default();
        let json = config.to_json().unwrap();
        let deserialized = NodeConfig::from_json(&json).unwrap();
        assert_eq!(config.listen.addrs, deserialized.listen.addrs);
        assert_eq!(config.connection_manager, deserialized.connection_manager);
        assert_eq!(config.bootstrap_peers, deserialized.bootstrap_peers);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config = NodeConfig::from_json(r#"{ "enable_mdns": false, "dial_timeout_secs": 5 }"#)
            .unwrap();
        assert!(!config.enable_mdns);
        assert_eq!(config.dial_timeout(), Duration::from_secs(5));
        assert_eq!(config.listen.addrs, ListenConfig::default().addrs);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.dial_timeout_secs, 30);
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(NodeConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_invalid_listen_addr_fails_validation() {
        let mut config = NodeConfig::default();
        config.listen.addrs.push("not-a-multiaddr".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAddress { field: "listen.addrs", .. })
        ));
    }

    #[test]
    fn test_inverted_watermarks_fail_validation() {
        let mut config = NodeConfig::default();
        config.connection_manager.low_water = 500;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConnectionManager(_))
        ));
    }

    #[test]
    fn test_bad_seed_entry_passes_validation() {
        let mut config = NodeConfig::default();
        config.bootstrap_peers.push("not a multiaddr".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_public_addr_is_optional() {
        let listen = ListenConfig {
            addrs: vec![],
            public_addr: None,
        };
        assert!(listen.public_multiaddr().unwrap().is_none());
    }
}
