//! Node configuration, stored as `hush.toml`.
//!
//! Every field has a default, so an empty or missing file yields a working
//! loopback-only node:
//!
//! ```toml
//! [node]
//! data_dir = ".hush"
//! key_length = 32
//!
//! [network]
//! port = 7400
//! discovery_port = 7401
//! bootstrap = ["192.168.1.20:7400"]
//!
//! [[network.interfaces]]
//! address = "192.168.1.12"
//! broadcast = "192.168.1.255"
//! ```

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILENAME: &str = "hush.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub workers: WorkerConfig,
    pub schedule: ScheduleConfig,
}

/// Protocol limits and storage location (`[node]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    /// Length in bytes of every negotiated conversation key.
    pub key_length: usize,
    /// Requests stamped further than this into the future are rejected.
    pub max_clock_skew_secs: u64,
    /// Widest window answered to a catch-up request, and the window we ask for.
    pub catch_up_window_secs: u64,
    /// Conversations still negotiating after this long are dropped.
    pub pending_conversation_ttl_secs: u64,
    pub max_envelope_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".hush"),
            key_length: crate::crypto::SYMMETRIC_KEY_SIZE,
            max_clock_skew_secs: 300,
            catch_up_window_secs: 24 * 60 * 60,
            pending_conversation_ttl_secs: 7 * 24 * 60 * 60,
            max_envelope_bytes: 1024 * 1024,
        }
    }
}

/// One local network interface to listen on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub address: IpAddr,
    /// Directed broadcast address for LAN announcements, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<IpAddr>,
}

/// Sockets and peers (`[network]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub port: u16,
    pub discovery_port: u16,
    pub interfaces: Vec<InterfaceConfig>,
    pub send_timeout_ms: u64,
    pub bootstrap: Vec<SocketAddr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 7400,
            discovery_port: 7401,
            interfaces: vec![InterfaceConfig {
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                broadcast: None,
            }],
            send_timeout_ms: 2000,
            bootstrap: Vec::new(),
        }
    }
}

/// Queue worker pool (`[workers]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub inbound: usize,
    pub outbound: usize,
    /// Backoff between empty polls, and the granularity of stop checks.
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            inbound: 1,
            outbound: 1,
            poll_interval_ms: 50,
        }
    }
}

/// Periodic job intervals in seconds (`[schedule]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub announce_secs: u64,
    pub discover_secs: u64,
    pub publish_secs: u64,
    pub reannounce_parts_secs: u64,
    pub catch_up_secs: u64,
    pub expire_pending_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            announce_secs: 30,
            discover_secs: 60,
            publish_secs: 120,
            reannounce_parts_secs: 90,
            catch_up_secs: 300,
            expire_pending_secs: 3600,
        }
    }
}

impl Config {
    /// Load from `path`, returning defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.key_length == 0 {
            return Err(ConfigError::Invalid("node.key_length must be positive".into()));
        }
        if self.network.interfaces.is_empty() {
            return Err(ConfigError::Invalid(
                "network.interfaces must list at least one interface".into(),
            ));
        }
        if self.workers.inbound == 0 || self.workers.outbound == 0 {
            return Err(ConfigError::Invalid("worker counts must be positive".into()));
        }
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.node.data_dir.join("hush.db")
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.network.send_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.workers.poll_interval_ms.max(1))
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.node.max_clock_skew_secs)
    }

    pub fn catch_up_window(&self) -> Duration {
        Duration::from_secs(self.node.catch_up_window_secs)
    }

    pub fn pending_conversation_ttl(&self) -> Duration {
        Duration::from_secs(self.node.pending_conversation_ttl_secs)
    }
}
