use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use shared_crypto::Secp256k1KeyPair;
use thiserror::Error;

use crate::domain::{Netlist, Node, NodeType};
use crate::udp::Config;

// ============================================================================
// File layout
// ============================================================================

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    discovery: DiscoverySection,
    #[serde(default)]
    bootnodes: Vec<String>,
    #[serde(default)]
    authorized_nodes: Vec<String>,
    /// Hex-encoded secp256k1 secret. A fresh key is generated when absent.
    private_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DiscoverySection {
    network_id: Option<u64>,
    listen_addr: Option<String>,
    announce_addr: Option<String>,
    node_db_path: Option<PathBuf>,
    node_type: Option<String>,
    max_neighbors_node: Option<usize>,
    net_restrict: Option<String>,
}

// ============================================================================
// TomlConfigProvider
// ============================================================================

/// TOML-based configuration provider.
///
/// # Config File Format
///
/// ```toml
/// private_key = "289c2857d4598e37fb9647507e47a309d6133539bf21a8b9cb6df88fd5232032"
/// bootnodes = [
///     "kni://a979fb57...@10.0.0.1:32323?ntype=bn",
/// ]
/// authorized_nodes = []
///
/// [discovery]
/// network_id = 1000
/// listen_addr = "0.0.0.0:32323"
/// announce_addr = "203.0.113.7:32323"
/// node_db_path = "/var/lib/node/nodes"
/// node_type = "en"
/// max_neighbors_node = 0
/// net_restrict = "10.0.0.0/8, 192.168.0.0/16"
/// ```
///
/// Missing keys fall back to [`Config::default`].
#[derive(Debug, Clone)]
pub struct TomlConfigProvider {
    config: Config,
}

impl TomlConfigProvider {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or any value is invalid.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let defaults = Config::default();
        let d = file.discovery;

        let private_key = match file.private_key {
            Some(hex_key) => parse_private_key(&hex_key)?,
            None => defaults.private_key,
        };
        let listen_addr = match d.listen_addr {
            Some(s) => parse_socket_addr("listen_addr", &s)?,
            None => defaults.listen_addr,
        };
        let announce_addr = d
            .announce_addr
            .map(|s| parse_socket_addr("announce_addr", &s))
            .transpose()?;
        let node_type = match d.node_type {
            Some(s) => s.parse::<NodeType>().map_err(|e| ConfigError::Invalid {
                field: "node_type",
                error: e.to_string(),
            })?,
            None => defaults.node_type,
        };
        let net_restrict = d
            .net_restrict
            .map(|s| {
                Netlist::parse(&s).map_err(|e| ConfigError::Invalid {
                    field: "net_restrict",
                    error: e.to_string(),
                })
            })
            .transpose()?;

        let config = Config {
            network_id: d.network_id.unwrap_or(defaults.network_id),
            private_key,
            listen_addr,
            announce_addr,
            node_db_path: d.node_db_path,
            net_restrict,
            bootnodes: parse_nodes("bootnodes", &file.bootnodes)?,
            unhandled: None,
            node_type,
            max_neighbors_node: d.max_neighbors_node.unwrap_or(defaults.max_neighbors_node),
            authorized_nodes: parse_nodes("authorized_nodes", &file.authorized_nodes)?,
        };
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }
}

fn parse_private_key(s: &str) -> Result<Secp256k1KeyPair, ConfigError> {
    let invalid = |error: String| ConfigError::Invalid {
        field: "private_key",
        error,
    };
    let bytes = hex::decode(s.trim().trim_start_matches("0x")).map_err(|e| invalid(e.to_string()))?;
    Secp256k1KeyPair::from_slice(&bytes).map_err(|e| invalid(e.to_string()))
}

fn parse_socket_addr(field: &'static str, s: &str) -> Result<SocketAddr, ConfigError> {
    s.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
        field,
        error: format!("{s:?}: {e}"),
    })
}

fn parse_nodes(field: &'static str, uris: &[String]) -> Result<Vec<Node>, ConfigError> {
    uris.iter()
        .map(|uri| {
            uri.parse::<Node>().map_err(|e| ConfigError::Invalid {
                field,
                error: format!("{uri:?}: {e}"),
            })
        })
        .collect()
}

/// Errors that can occur during config loading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("Failed to read {path}: {error}")]
    Io {
        /// Path of the file that failed to load.
        path: String,
        /// Error message from the I/O operation.
        error: String,
    },
    /// TOML parsing error.
    #[error("Failed to parse config: {0}")]
    Parse(String),
    /// A value parsed but is not acceptable.
    #[error("Invalid {field}: {error}")]
    Invalid {
        field: &'static str,
        error: String,
    },
}
