//! Client configuration

use peerdrop_core::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path, holds `keys/`
    pub data_dir: String,

    /// Directory whose regular files are served, relative to `data_dir`
    /// unless absolute
    pub shared_dir: String,

    /// Where downloads are written, relative to `data_dir` unless absolute
    pub output_dir: String,

    /// Peer server configuration
    pub server: ServerConfig,

    /// Discovery registry configuration
    pub registry: RegistryConfig,

    /// Transfer configuration
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,
    /// Port to listen on
    pub port: u16,
    /// Address advertised to the registry (observed address if unset)
    pub advertise_ip: Option<String>,
    /// Chunk size used when serving files, at most `chunk::MAX_CHUNK_SIZE`
    pub chunk_size: usize,
    /// Seconds to wait for the next frame before dropping a connection
    pub idle_timeout_secs: u64,
    /// Reject a HELLO whose peer id is not the hash of its public key
    pub verify_peer_id: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Base URL of the registry
    pub url: String,
    /// Seconds between heartbeats
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum chunk fetches in flight per download
    pub max_concurrent_chunks: usize,
    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Per-frame read timeout in seconds
    pub read_timeout_secs: u64,
    /// How chunk fetches map onto encrypted sessions
    pub session_mode: SessionMode,
}

/// How a download uses connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    /// New connection and handshake for every chunk
    #[default]
    PerRequest,
    /// A fixed set of long-lived sessions, each issuing many GETs
    Pooled,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.peerdrop".to_string(),
            shared_dir: "shared".to_string(),
            output_dir: "downloads".to_string(),
            server: ServerConfig::default(),
            registry: RegistryConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: 9000,
            advertise_ip: None,
            chunk_size: peerdrop_core::CHUNK_SIZE,
            idle_timeout_secs: 30,
            verify_peer_id: true,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000".to_string(),
            heartbeat_interval_secs: 30,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: peerdrop_core::DEFAULT_CONCURRENCY,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            session_mode: SessionMode::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            tracing::debug!("Loading config from {}", path.display());
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }

    pub fn key_dir(&self) -> PathBuf {
        self.data_dir().join("keys")
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.resolve(&self.shared_dir)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.resolve(&self.output_dir)
    }

    fn resolve(&self, dir: &str) -> PathBuf {
        let path = expand_path(dir);
        if path.is_absolute() {
            path
        } else {
            self.data_dir().join(path)
        }
    }

    /// Transport settings for outgoing connections
    pub fn client_transport(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(self.transfer.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.transfer.read_timeout_secs),
            verify_peer_id: self.server.verify_peer_id,
        }
    }

    /// Transport settings for accepted connections
    pub fn server_transport(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(self.transfer.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.server.idle_timeout_secs),
            verify_peer_id: self.server.verify_peer_id,
        }
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
