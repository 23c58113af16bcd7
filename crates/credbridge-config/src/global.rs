//! Bridge configuration for credbridge
//!
//! Located at `~/.config/credbridge/config.toml`

use crate::{ConfigError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on `max_request_bytes`, whatever the config file says
pub const MAX_REQUEST_BYTES_LIMIT: usize = 1024 * 1024;

/// Global credbridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub bridge: BridgeSettings,
    pub tcp: TcpSettings,
    pub helpers: HelperSettings,
}

/// How the bridge endpoint is exposed to the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Filesystem-backed local socket under the state root
    Unix,
    /// Windows named pipe, for clients on the host itself
    Pipe,
    /// TCP listener restricted to an allow-list of networks
    Tcp,
}

impl Default for TransportKind {
    /// The VM on a Windows host cannot open the host's pipes or sockets
    /// through the shared mount, so it gets TCP
    fn default() -> Self {
        if cfg!(windows) {
            TransportKind::Tcp
        } else {
            TransportKind::Unix
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Unix => write!(f, "unix"),
            TransportKind::Pipe => write!(f, "pipe"),
            TransportKind::Tcp => write!(f, "tcp"),
        }
    }
}

/// Listener and per-request limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// State root holding the socket and helper config (default: data dir)
    pub root_dir: Option<String>,
    pub transport: TransportKind,
    /// Deadline for reading a request from a connection
    pub read_timeout_secs: u64,
    /// Deadline for a single credential helper invocation
    pub helper_timeout_secs: u64,
    /// Largest request accepted in a single read
    pub max_request_bytes: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            root_dir: None,
            transport: TransportKind::default(),
            read_timeout_secs: 10,
            helper_timeout_secs: 30,
            max_request_bytes: 4096,
        }
    }
}

/// Legacy loopback TCP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    pub listen: String,
    /// CIDR ranges allowed to connect (loopback plus the VM network)
    pub allowed_networks: Vec<String>,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:47365".to_string(),
            allowed_networks: vec!["127.0.0.0/8".to_string(), "192.168.5.0/24".to_string()],
        }
    }
}

/// Where credential helper configuration and binaries are found
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperSettings {
    /// Path to the helper config JSON (default: `<root>/config.json`)
    pub docker_config: Option<String>,
    /// Directories searched before `PATH` (bundled helpers)
    pub search_dirs: Vec<String>,
    /// Directories searched after `PATH`
    pub fallback_dirs: Vec<String>,
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            docker_config: None,
            search_dirs: Vec::new(),
            fallback_dirs: default_fallback_dirs(),
        }
    }
}

#[cfg(windows)]
fn default_fallback_dirs() -> Vec<String> {
    vec!["C:\\Program Files\\Docker\\Docker\\resources\\bin".to_string()]
}

#[cfg(not(windows))]
fn default_fallback_dirs() -> Vec<String> {
    vec!["/usr/local/bin".to_string(), "/opt/homebrew/bin".to_string()]
}

impl BridgeConfig {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        tracing::debug!(
            "Loaded config from {:?}: transport={}",
            path,
            config.bridge.transport
        );

        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                path: path.to_path_buf(),
                source: e,
            })?;
        }

        let content = toml::to_string_pretty(self)?;

        std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "credbridge").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path
    pub fn data_dir() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "credbridge").ok_or(ConfigError::NoDataDir)?;
        Ok(dirs.data_dir().to_path_buf())
    }

    /// State root: the configured `root_dir` (with `~` expanded) or the data dir
    pub fn root_dir(&self) -> Result<PathBuf> {
        match &self.bridge.root_dir {
            Some(dir) if !dir.is_empty() => Ok(expand_path(dir)),
            _ => Self::data_dir(),
        }
    }

    /// Path of the credential helper config JSON for a given state root
    pub fn docker_config_path(&self, root: &Path) -> PathBuf {
        match &self.helpers.docker_config {
            Some(path) if !path.is_empty() => expand_path(path),
            _ => root.join("config.json"),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.read_timeout_secs)
    }

    /// `max_request_bytes` clamped to `1..=MAX_REQUEST_BYTES_LIMIT`
    pub fn max_request_bytes(&self) -> usize {
        self.bridge.max_request_bytes.clamp(1, MAX_REQUEST_BYTES_LIMIT)
    }

    pub fn helper_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.helper_timeout_secs)
    }

    /// Expanded `search_dirs`
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        self.helpers.search_dirs.iter().map(|d| expand_path(d)).collect()
    }

    /// Expanded `fallback_dirs`
    pub fn fallback_dirs(&self) -> Vec<PathBuf> {
        self.helpers.fallback_dirs.iter().map(|d| expand_path(d)).collect()
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
