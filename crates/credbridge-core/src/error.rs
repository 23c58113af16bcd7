//! Error types for credbridge-core

use thiserror::Error;

/// Malformed bridge requests
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty request")]
    Empty,

    #[error("request exceeds {0} bytes")]
    TooLarge(usize),

    #[error("request is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("command {command} expects {expected} line(s), got {actual}")]
    Arity {
        command: String,
        expected: usize,
        actual: usize,
    },

    #[error("store requires a username and secret")]
    IncompleteCredential,

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unparsable registry URL: {0}")]
    UnparsableUrl(String),

    #[error("unsupported scheme in registry URL: {0}")]
    UnsupportedScheme(String),

    #[error("no credential helper found: {0}")]
    NoHelper(String),

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("credential helper failed: {0}")]
    Invocation(String),

    #[error("credential helper timed out after {0}s")]
    HelperTimeout(u64),

    #[error("endpoint already in use: {0}")]
    EndpointInUse(String),

    #[error("bridge replied with error: {0}")]
    Remote(String),

    #[error("Login failed: {0}")]
    Login(String),

    #[error("Configuration error: {0}")]
    Config(#[from] credbridge_config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// No helper could be chosen for the request
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            BridgeError::NoHelper(_) | BridgeError::UnsupportedPlatform(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
