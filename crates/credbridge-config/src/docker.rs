//! Credential helper configuration
//!
//! A Docker-compatible `config.json` naming which `docker-credential-*`
//! helper owns which registry. Re-read on every request so edits take effect
//! without restarting the bridge.

use crate::{ConfigError, Result};
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Parsed helper configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct DockerCredConfig {
    /// Default credential store (e.g. "osxkeychain", "wincred")
    pub creds_store: Option<String>,
    /// Per-registry credential helpers, keyed by host
    pub cred_helpers: HashMap<String, String>,
    /// Inline credentials
    pub auths: HashMap<String, AuthEntry>,
}

/// An entry in config.json "auths"
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthEntry {
    /// Base64-encoded "username:password"
    pub auth: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl DockerCredConfig {
    /// Load from a path. A missing file is an empty config.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No helper config at {:?}", path);
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::ReadError {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        serde_json::from_str(&content).map_err(|e| ConfigError::JsonParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// First per-registry helper matching any of the lookup keys, in order
    pub fn helper_for<'a>(&'a self, keys: &[&str]) -> Option<(&'a str, &'a str)> {
        keys.iter().find_map(|key| {
            self.cred_helpers
                .get_key_value(*key)
                .filter(|(_, helper)| !helper.is_empty())
                .map(|(k, helper)| (k.as_str(), helper.as_str()))
        })
    }

    /// The default store, if configured and non-empty
    pub fn default_store(&self) -> Option<&str> {
        self.creds_store.as_deref().filter(|s| !s.is_empty())
    }

    /// Username and secret stored inline under "auths" for one of the keys
    pub fn inline_credential(&self, keys: &[&str]) -> Option<(String, String)> {
        let entry = keys.iter().find_map(|key| self.auths.get(*key))?;

        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            if !username.is_empty() && !password.is_empty() {
                return Some((username.clone(), password.clone()));
            }
        }

        entry.auth.as_deref().and_then(decode_auth)
    }
}

/// Decode a base64 "user:secret" pair
pub fn decode_auth(auth: &str) -> Option<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, secret) = decoded.split_once(':')?;
    if user.is_empty() || secret.is_empty() {
        return None;
    }
    Some((user.to_string(), secret.to_string()))
}

/// Validate a credential helper name.
///
/// Names like "osxkeychain", "ecr-login", "wincred" only contain
/// alphanumerics, hyphens, and underscores.
pub fn is_valid_helper_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}
