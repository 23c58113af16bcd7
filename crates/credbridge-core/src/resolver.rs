//! Native credential helper resolution
//!
//! Picks the `docker-credential-*` executable for a registry. Candidates come
//! from the helper config (per-registry, then default store) and finally the
//! platform's native store; the first candidate whose binary exists wins.

use crate::{BridgeError, RegistryUrl, Result};
use credbridge_config::{is_valid_helper_name, BridgeConfig, DockerCredConfig};
use std::path::{Path, PathBuf};

/// Prefix shared by every credential helper binary
pub const HELPER_PREFIX: &str = "docker-credential-";

/// Subdirectory of the state root holding bundled helpers
pub const BUNDLED_HELPERS_DIR: &str = "cred-helpers";

/// Where a helper choice came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperScope {
    /// `credHelpers` entry for this registry
    PerRegistry,
    /// `credsStore`
    GlobalDefault,
    /// The platform's native store
    OsDefault,
}

impl std::fmt::Display for HelperScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HelperScope::PerRegistry => write!(f, "per-registry"),
            HelperScope::GlobalDefault => write!(f, "global-default"),
            HelperScope::OsDefault => write!(f, "os-default"),
        }
    }
}

/// A resolved helper for one request. Recomputed every time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperConfig {
    pub binary_name: String,
    pub resolved_path: PathBuf,
    pub scope: HelperScope,
}

/// Helper name of the platform's native store
pub fn os_default_helper() -> Result<&'static str> {
    if cfg!(target_os = "macos") {
        Ok("osxkeychain")
    } else if cfg!(windows) {
        Ok("wincred")
    } else {
        Err(BridgeError::UnsupportedPlatform(
            std::env::consts::OS.to_string(),
        ))
    }
}

/// `docker-credential-<name>`, with `.exe` on Windows
pub fn helper_binary_name(helper: &str) -> String {
    format!("{}{}{}", HELPER_PREFIX, helper, std::env::consts::EXE_SUFFIX)
}

/// Ordered search policy for helper binaries
#[derive(Debug, Clone, Default)]
pub struct HelperResolver {
    /// Searched first (bundled install locations)
    search_dirs: Vec<PathBuf>,
    /// Searched after `PATH`
    fallback_dirs: Vec<PathBuf>,
    search_env_path: bool,
}

impl HelperResolver {
    pub fn new(search_dirs: Vec<PathBuf>, fallback_dirs: Vec<PathBuf>) -> Self {
        Self {
            search_dirs,
            fallback_dirs,
            search_env_path: true,
        }
    }

    /// Search policy from bridge config: configured dirs, `<root>/cred-helpers`,
    /// the directory of the running executable, `PATH`, then fallbacks.
    pub fn from_config(config: &BridgeConfig, root: &Path) -> Self {
        let mut search_dirs = config.search_dirs();
        search_dirs.push(root.join(BUNDLED_HELPERS_DIR));
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
        {
            search_dirs.push(exe_dir);
        }
        Self::new(search_dirs, config.fallback_dirs())
    }

    /// Do not consult `PATH`
    pub fn without_env_path(mut self) -> Self {
        self.search_env_path = false;
        self
    }

    /// Choose the helper for a registry
    pub fn resolve(&self, registry: &RegistryUrl, config: &DockerCredConfig) -> Result<HelperConfig> {
        let keys = registry.lookup_keys();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();

        let mut candidates = Vec::new();
        if let Some((key, helper)) = config.helper_for(&key_refs) {
            tracing::debug!("credHelpers entry {} -> {}", key, helper);
            candidates.push((helper.to_string(), HelperScope::PerRegistry));
        }
        let helper = self.pick(candidates, config)?;
        tracing::debug!(
            "Resolved {} helper for {}: {}",
            helper.scope,
            registry.canonical_identifier(),
            helper.resolved_path.display()
        );
        Ok(helper)
    }

    /// Choose the helper that owns registries without a per-registry entry
    pub fn resolve_default(&self, config: &DockerCredConfig) -> Result<HelperConfig> {
        self.pick(Vec::new(), config)
    }

    fn pick(
        &self,
        mut candidates: Vec<(String, HelperScope)>,
        config: &DockerCredConfig,
    ) -> Result<HelperConfig> {
        if let Some(store) = config.default_store() {
            candidates.push((store.to_string(), HelperScope::GlobalDefault));
        }
        let os_default = os_default_helper();
        if let Ok(native) = os_default {
            candidates.push((native.to_string(), HelperScope::OsDefault));
        }

        let mut tried = Vec::new();
        for (helper, scope) in candidates {
            if !is_valid_helper_name(&helper) {
                tracing::warn!("Skipping invalid credential helper name: {:?}", helper);
                continue;
            }
            let binary_name = helper_binary_name(&helper);
            if let Some(resolved_path) = self.locate(&binary_name) {
                return Ok(HelperConfig {
                    binary_name,
                    resolved_path,
                    scope,
                });
            }
            tried.push(binary_name);
        }

        match os_default {
            Err(e) if tried.is_empty() => Err(e),
            _ => Err(BridgeError::NoHelper(if tried.is_empty() {
                "no helper configured".to_string()
            } else {
                format!("{} not found", tried.join(", "))
            })),
        }
    }

    /// Find an executable by name: search dirs, then `PATH`, then fallbacks
    pub fn locate(&self, binary_name: &str) -> Option<PathBuf> {
        let env_path = if self.search_env_path {
            std::env::var_os("PATH")
                .map(|p| std::env::split_paths(&p).collect::<Vec<_>>())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        self.search_dirs
            .iter()
            .chain(env_path.iter())
            .chain(self.fallback_dirs.iter())
            .map(|dir| dir.join(binary_name))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::write_script;

    fn config(json: &str) -> DockerCredConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_helper_binary_name() {
        assert_eq!(helper_binary_name("osxkeychain"), "docker-credential-osxkeychain");
    }

    #[test]
    fn test_per_registry_wins_over_default_store() {
        let tmp = tempfile::tempdir().unwrap();
        write_script(tmp.path(), "docker-credential-ecr-login", "exit 0");
        write_script(tmp.path(), "docker-credential-pass", "exit 0");

        let resolver = HelperResolver::new(vec![tmp.path().to_path_buf()], vec![]).without_env_path();
        let cfg = config(r#"{"credsStore": "pass", "credHelpers": {"ecr.example.com": "ecr-login"}}"#);

        let ecr = RegistryUrl::parse("ecr.example.com").unwrap();
        let helper = resolver.resolve(&ecr, &cfg).unwrap();
        assert_eq!(helper.scope, HelperScope::PerRegistry);
        assert_eq!(helper.binary_name, "docker-credential-ecr-login");
        assert_eq!(helper.resolved_path, tmp.path().join("docker-credential-ecr-login"));

        let other = RegistryUrl::parse("ghcr.io").unwrap();
        let helper = resolver.resolve(&other, &cfg).unwrap();
        assert_eq!(helper.scope, HelperScope::GlobalDefault);
        assert_eq!(helper.binary_name, "docker-credential-pass");
    }

    #[test]
    fn test_resolve_default_ignores_cred_helpers() {
        let tmp = tempfile::tempdir().unwrap();
        write_script(tmp.path(), "docker-credential-ecr-login", "exit 0");
        write_script(tmp.path(), "docker-credential-pass", "exit 0");

        let resolver = HelperResolver::new(vec![tmp.path().to_path_buf()], vec![]).without_env_path();
        let cfg = config(r#"{"credsStore": "pass", "credHelpers": {"ecr.example.com": "ecr-login"}}"#);
        let helper = resolver.resolve_default(&cfg).unwrap();
        assert_eq!(helper.binary_name, "docker-credential-pass");
    }

    #[test]
    fn test_missing_binary_falls_through_to_next_candidate() {
        let tmp = tempfile::tempdir().unwrap();
        write_script(tmp.path(), "docker-credential-pass", "exit 0");

        let resolver = HelperResolver::new(vec![tmp.path().to_path_buf()], vec![]).without_env_path();
        let cfg = config(r#"{"credsStore": "pass", "credHelpers": {"ghcr.io": "missing"}}"#);
        let helper = resolver
            .resolve(&RegistryUrl::parse("ghcr.io").unwrap(), &cfg)
            .unwrap();
        assert_eq!(helper.scope, HelperScope::GlobalDefault);
    }

    #[test]
    fn test_no_helper_found() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = HelperResolver::new(vec![tmp.path().to_path_buf()], vec![]).without_env_path();
        let err = resolver
            .resolve(
                &RegistryUrl::parse("ghcr.io").unwrap(),
                &config(r#"{"credsStore": "nonexistent"}"#),
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::NoHelper(ref m) if m.contains("docker-credential-nonexistent")));
        assert!(err.is_resolution());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unconfigured_linux_is_unsupported_platform() {
        let resolver = HelperResolver::default().without_env_path();
        let err = resolver
            .resolve(&RegistryUrl::parse("ghcr.io").unwrap(), &config("{}"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedPlatform(_)));
        assert!(err.is_resolution());
    }

    #[test]
    fn test_non_executable_file_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("docker-credential-plain"), "#!/bin/sh\n").unwrap();
        let resolver = HelperResolver::new(vec![tmp.path().to_path_buf()], vec![]).without_env_path();
        assert!(resolver.locate("docker-credential-plain").is_none());
    }

    #[test]
    fn test_search_dirs_before_fallbacks() {
        let first = tempfile::tempdir().unwrap();
        let fallback = tempfile::tempdir().unwrap();
        write_script(first.path(), "docker-credential-x", "exit 0");
        write_script(fallback.path(), "docker-credential-x", "exit 0");

        let resolver = HelperResolver::new(
            vec![first.path().to_path_buf()],
            vec![fallback.path().to_path_buf()],
        )
        .without_env_path();
        assert_eq!(
            resolver.locate("docker-credential-x"),
            Some(first.path().join("docker-credential-x"))
        );

        let resolver = HelperResolver::new(vec![], vec![fallback.path().to_path_buf()]).without_env_path();
        assert_eq!(
            resolver.locate("docker-credential-x"),
            Some(fallback.path().join("docker-credential-x"))
        );
    }

    #[test]
    fn test_invalid_helper_names_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = HelperResolver::new(vec![tmp.path().to_path_buf()], vec![]).without_env_path();
        let err = resolver
            .resolve(
                &RegistryUrl::parse("ghcr.io").unwrap(),
                &config(r#"{"credsStore": "../../bin/sh"}"#),
            )
            .unwrap_err();
        assert!(err.is_resolution());
    }
}
