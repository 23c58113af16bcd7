//! Configuration errors

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse bridge settings at {path}: {source}")]
    TomlParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to parse helper config at {path}: {source}")]
    JsonParseError {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to serialize bridge settings: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid tcp.listen address {value:?}: {source}")]
    InvalidListenAddress {
        value: String,
        source: std::net::AddrParseError,
    },

    #[error("Invalid network {0:?} in tcp.allowed_networks")]
    InvalidNetwork(String),

    #[error("No config directory for this user")]
    NoConfigDir,

    #[error("No data directory for this user")]
    NoDataDir,

    #[error("Failed to write {path}: {source}")]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
