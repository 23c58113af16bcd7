//! Credential backend abstraction
//!
//! The bridge dispatches every parsed request to a [`CredentialBackend`].
//! [`NativeBackend`] resolves and runs the host's credential helpers; tests
//! substitute an in-memory store.

use crate::{
    CredentialRecord, HelperInvoker, HelperOutcome, HelperResolver, RegistryUrl, Result,
};
use async_trait::async_trait;
use credbridge_config::{BridgeConfig, DockerCredConfig};
use std::path::{Path, PathBuf};

/// Where credentials actually live. Registries arrive already normalized.
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    async fn get(&self, registry: &RegistryUrl) -> Result<HelperOutcome>;

    /// `record.server_url` is the registry's canonical identifier
    async fn store(&self, registry: &RegistryUrl, record: &CredentialRecord)
        -> Result<HelperOutcome>;

    async fn erase(&self, registry: &RegistryUrl) -> Result<HelperOutcome>;

    async fn list(&self) -> Result<HelperOutcome>;
}

/// Backend that delegates to `docker-credential-*` helpers on the host
#[derive(Debug, Clone)]
pub struct NativeBackend {
    /// Helper config JSON, re-read for every request
    docker_config: PathBuf,
    resolver: HelperResolver,
    invoker: HelperInvoker,
}

impl NativeBackend {
    pub fn new(docker_config: PathBuf, resolver: HelperResolver, invoker: HelperInvoker) -> Self {
        Self {
            docker_config,
            resolver,
            invoker,
        }
    }

    pub fn from_config(config: &BridgeConfig, root: &Path) -> Self {
        Self::new(
            config.docker_config_path(root),
            HelperResolver::from_config(config, root),
            HelperInvoker::new(config.helper_timeout()),
        )
    }

    pub fn docker_config_path(&self) -> &Path {
        &self.docker_config
    }

    /// Current helper config. An unreadable file counts as empty so the
    /// platform default still applies.
    fn helper_config(&self) -> DockerCredConfig {
        DockerCredConfig::load_from(&self.docker_config).unwrap_or_else(|e| {
            tracing::warn!("Ignoring helper config: {}", e);
            DockerCredConfig::default()
        })
    }
}

#[async_trait]
impl CredentialBackend for NativeBackend {
    async fn get(&self, registry: &RegistryUrl) -> Result<HelperOutcome> {
        let config = self.helper_config();
        let server_url = registry.canonical_identifier();

        let helper = match self.resolver.resolve(registry, &config) {
            Ok(helper) => helper,
            Err(e) if e.is_resolution() => {
                let keys = registry.lookup_keys();
                let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                if let Some((username, secret)) = config.inline_credential(&key_refs) {
                    tracing::debug!("Using inline auths entry for {}", server_url);
                    return Ok(HelperOutcome::Found(CredentialRecord::new(
                        server_url, username, secret,
                    )));
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.invoker.get(&helper, &server_url).await
    }

    async fn store(
        &self,
        registry: &RegistryUrl,
        record: &CredentialRecord,
    ) -> Result<HelperOutcome> {
        let helper = self.resolver.resolve(registry, &self.helper_config())?;
        self.invoker.store(&helper, record).await
    }

    async fn erase(&self, registry: &RegistryUrl) -> Result<HelperOutcome> {
        let helper = self.resolver.resolve(registry, &self.helper_config())?;
        self.invoker
            .erase(&helper, &registry.canonical_identifier())
            .await
    }

    async fn list(&self) -> Result<HelperOutcome> {
        let helper = self.resolver.resolve_default(&self.helper_config())?;
        self.invoker.list(&helper).await
    }
}
