//! Test support utilities for credbridge-core
//!
//! Provides a file-backed fake `docker-credential-*` helper and an in-memory
//! [`CredentialBackend`] so the bridge can be exercised without a keychain.

use crate::{BridgeError, CredentialBackend, CredentialRecord, HelperOutcome, RegistryUrl, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Write an executable `/bin/sh` script and return its path
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
    }
    path
}

const FAKE_HELPER: &str = r##"STORE="$(dirname "$0")/.store-__NAME__"
mkdir -p "$STORE"
key() { printf '%s' "$1" | tr -c 'A-Za-z0-9.-' '_'; }
case "$1" in
  store)
    input=$(cat)
    url=$(printf '%s' "$input" | sed -n 's/.*"ServerURL":"\([^"]*\)".*/\1/p')
    [ -n "$url" ] || { echo "missing ServerURL"; exit 1; }
    printf '%s' "$input" > "$STORE/$(key "$url")"
    ;;
  get)
    url=$(cat)
    f="$STORE/$(key "$url")"
    if [ -f "$f" ]; then cat "$f"; else echo "credentials not found in native keychain"; exit 1; fi
    ;;
  erase)
    url=$(cat)
    f="$STORE/$(key "$url")"
    if [ -f "$f" ]; then rm -f "$f"; else echo "credentials not found in native keychain"; exit 1; fi
    ;;
  list)
    echo "{}"
    ;;
  *)
    echo "unknown verb: $1"
    exit 1
    ;;
esac"##;

/// Install `docker-credential-<name>` into `dir`: a helper that keeps one
/// file per server URL next to itself and speaks the helper protocol.
pub fn install_fake_helper(dir: &Path, name: &str) -> PathBuf {
    write_script(
        dir,
        &format!("docker-credential-{}", name),
        &FAKE_HELPER.replace("__NAME__", name),
    )
}

/// Records which methods were called on the backend
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryCall {
    Get { server_url: String },
    Store { server_url: String },
    Erase { server_url: String },
    List,
}

/// Credential backend holding records in memory, keyed by canonical identifier
#[derive(Default)]
pub struct MemoryBackend {
    pub records: Arc<Mutex<HashMap<String, CredentialRecord>>>,
    pub calls: Arc<Mutex<Vec<MemoryCall>>>,
    /// Error message every call fails with, as an invocation error
    pub failure: Arc<Mutex<Option<String>>>,
    /// Delay applied before each call
    pub latency: Arc<Mutex<Option<std::time::Duration>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every subsequent call
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn set_latency(&self, latency: std::time::Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn insert(&self, record: CredentialRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.server_url.clone(), record);
    }

    pub fn get_calls(&self) -> Vec<MemoryCall> {
        self.calls.lock().unwrap().clone()
    }

    async fn enter(&self, call: MemoryCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.failure.lock().unwrap().clone() {
            Some(message) => Err(BridgeError::Invocation(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CredentialBackend for MemoryBackend {
    async fn get(&self, registry: &RegistryUrl) -> Result<HelperOutcome> {
        let key = registry.canonical_identifier();
        self.enter(MemoryCall::Get {
            server_url: key.clone(),
        })
        .await?;
        Ok(match self.records.lock().unwrap().get(&key) {
            Some(record) => HelperOutcome::Found(record.clone()),
            None => HelperOutcome::NotFound,
        })
    }

    async fn store(
        &self,
        registry: &RegistryUrl,
        record: &CredentialRecord,
    ) -> Result<HelperOutcome> {
        let key = registry.canonical_identifier();
        self.enter(MemoryCall::Store {
            server_url: key.clone(),
        })
        .await?;
        self.records.lock().unwrap().insert(key, record.clone());
        Ok(HelperOutcome::Completed)
    }

    async fn erase(&self, registry: &RegistryUrl) -> Result<HelperOutcome> {
        let key = registry.canonical_identifier();
        self.enter(MemoryCall::Erase {
            server_url: key.clone(),
        })
        .await?;
        Ok(match self.records.lock().unwrap().remove(&key) {
            Some(_) => HelperOutcome::Completed,
            None => HelperOutcome::NotFound,
        })
    }

    async fn list(&self) -> Result<HelperOutcome> {
        self.enter(MemoryCall::List).await?;
        Ok(HelperOutcome::Listed(
            self.records
                .lock()
                .unwrap()
                .values()
                .map(|r| (r.server_url.clone(), r.username.clone()))
                .collect(),
        ))
    }
}
