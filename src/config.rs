//! Node configuration.
//!
//! Loaded from YAML with a cascading priority system:
//! 1. `./qmesh.yaml` (current directory, highest priority)
//! 2. `~/.config/qmesh/qmesh.yaml`
//! 3. `/etc/qmesh/qmesh.yaml` (lowest priority)
//!
//! The first existing file wins; missing files fall back to defaults.
//!
//! ```yaml
//! node:
//!   service_port: 9001
//! discovery:
//!   port: 54321
//!   advertise_host: "192.168.1.10"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default config filename.
const CONFIG_FILENAME: &str = "qmesh.yaml";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid identity seed: {0}")]
    InvalidSeed(String),
}

/// Node settings (`node.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the TCP listener binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// TCP service port. 0 selects a kernel-assigned port.
    #[serde(default)]
    pub service_port: u16,

    /// Hex-encoded 32-byte signing seed. A fresh keypair is generated
    /// when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_seed: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            service_port: 0,
            identity_seed: None,
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

/// Discovery settings (`discovery.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Whether the UDP discovery loop runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// UDP discovery port.
    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// Host advertised in discovery replies.
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,

    /// Seconds between broadcast probes.
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_secs: u64,

    /// Seconds between stale-peer sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_discovery_port(),
            advertise_host: default_advertise_host(),
            broadcast_interval_secs: default_broadcast_interval(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_discovery_port() -> u16 {
    54321
}

fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}

fn default_broadcast_interval() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    300
}

/// Health monitoring settings (`health.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between health sweeps.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Seconds between metrics samples.
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Seconds without traffic before a peer is unhealthy.
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,

    /// Reconnection attempts before recovery is abandoned.
    #[serde(default = "default_max_reconnect")]
    pub max_reconnect_attempts: u32,

    /// Base of the exponential reconnection backoff, milliseconds.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            metrics_interval_secs: default_metrics_interval(),
            peer_timeout_secs: default_peer_timeout(),
            max_reconnect_attempts: default_max_reconnect(),
            backoff_base_ms: default_backoff_base(),
        }
    }
}

fn default_check_interval() -> u64 {
    5
}

fn default_metrics_interval() -> u64 {
    1
}

fn default_peer_timeout() -> u64 {
    30
}

fn default_max_reconnect() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    1000
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node settings (`node.*`).
    #[serde(default)]
    pub node: NodeConfig,

    /// Discovery settings (`discovery.*`).
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Health monitoring settings (`health.*`).
    #[serde(default)]
    pub health: HealthConfig,
}

impl Config {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from the standard search paths; the first existing file wins.
    /// Returns the config and the path it came from, if any.
    pub fn load() -> Result<(Self, Option<PathBuf>), ConfigError> {
        for path in Self::search_paths() {
            if path.exists() {
                let config = Self::load_file(&path)?;
                return Ok((config, Some(path)));
            }
        }
        Ok((Self::default(), None))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Standard search paths, highest priority first.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(
                PathBuf::from(home)
                    .join(".config")
                    .join("qmesh")
                    .join(CONFIG_FILENAME),
            );
        }
        paths.push(PathBuf::from("/etc/qmesh").join(CONFIG_FILENAME));
        paths
    }

    /// Decode the configured identity seed, if present.
    pub fn identity_seed(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        let Some(hex_seed) = &self.node.identity_seed else {
            return Ok(None);
        };
        let bytes = hex::decode(hex_seed)
            .map_err(|e| ConfigError::InvalidSeed(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| ConfigError::InvalidSeed(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Some(seed))
    }
}
