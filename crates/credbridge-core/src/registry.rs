//! Registry address normalization
//!
//! Maps whatever the user typed (`docker.io`, `localhost:5000`,
//! `https://registry.example.com/`) to the canonical identifier the native
//! store keys credentials by. `store` and `get` both go through
//! [`normalize`], so a credential saved under one spelling is found under
//! any other.

use crate::{BridgeError, Result};
use url::Url;

/// Default port for registries addressed without one
pub const STANDARD_HTTPS_PORT: u16 = 443;

/// Canonical key for Docker Hub
pub const DOCKER_INDEX_SERVER: &str = "https://index.docker.io/v1/";

/// Pseudo-scheme for registries reached through a namespace (mirror) host
pub const NAMESPACE_SCHEME: &str = "nerdctl-experimental";

const DOCKER_HUB_ALIAS: &str = "docker.io";
const DOCKER_INDEX_HOST: &str = "index.docker.io";
const NAMESPACE_QUERY_PARAMETER: &str = "ns";

/// Scheme of a parsed registry address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryScheme {
    Https,
    Namespace,
}

impl RegistryScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryScheme::Https => "https",
            RegistryScheme::Namespace => NAMESPACE_SCHEME,
        }
    }
}

/// A parsed, normalized registry address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryUrl {
    pub scheme: RegistryScheme,
    /// Host as it appears in a URL (IPv6 literals keep their brackets)
    pub host: String,
    pub port: u16,
    /// Path component; empty when the address has none
    pub path: String,
    /// Registry this address is a namespace of (`?ns=`). A back-reference
    /// for identifier composition only.
    pub namespace: Option<Box<RegistryUrl>>,
}

impl RegistryUrl {
    /// Parse a user-supplied registry address
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        let address = if address.is_empty() || address == DOCKER_HUB_ALIAS {
            DOCKER_INDEX_SERVER.to_string()
        } else if !has_scheme(address) {
            format!("https://{}", address)
        } else if let Some(rest) = strip_scheme(address, "http") {
            // Helper stores never distinguish http from https
            format!("https://{}", rest)
        } else {
            address.to_string()
        };

        let url = Url::parse(&address)
            .map_err(|e| BridgeError::UnparsableUrl(format!("{}: {}", address, e)))?;

        let scheme = match url.scheme() {
            "https" => RegistryScheme::Https,
            NAMESPACE_SCHEME => RegistryScheme::Namespace,
            other => return Err(BridgeError::UnsupportedScheme(other.to_string())),
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| BridgeError::UnparsableUrl(format!("{}: missing host", address)))?
            .to_string();

        let path = match url.path() {
            "/" => String::new(),
            p => p.to_string(),
        };

        let namespace = url
            .query_pairs()
            .find(|(k, v)| k == NAMESPACE_QUERY_PARAMETER && !v.is_empty())
            .map(|(_, v)| Self::parse(&v).map(Box::new))
            .transpose()?;

        Ok(Self {
            scheme,
            host,
            port: url.port().unwrap_or(STANDARD_HTTPS_PORT),
            path,
            namespace,
        })
    }

    /// Hostname without IPv6 brackets
    pub fn hostname(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// `host:port`
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn is_docker_index(&self) -> bool {
        self.scheme == RegistryScheme::Https
            && self.hostname() == DOCKER_INDEX_HOST
            && self.path == "/v1/"
            && self.port == STANDARD_HTTPS_PORT
    }

    /// The key the native store files this registry's credential under
    pub fn canonical_identifier(&self) -> String {
        if self.is_docker_index() {
            return DOCKER_INDEX_SERVER.to_string();
        }
        let identifier = self.host_port();
        match &self.namespace {
            Some(ns) => format!(
                "{}://{}/host/{}{}",
                NAMESPACE_SCHEME,
                ns.canonical_identifier(),
                identifier,
                self.path
            ),
            None => identifier,
        }
    }

    /// Keys to try, most specific first, when matching configuration entries
    pub fn lookup_keys(&self) -> Vec<String> {
        let mut keys = vec![self.canonical_identifier(), self.host_port()];
        keys.push(self.hostname().to_string());
        keys.dedup();
        keys
    }
}

impl std::fmt::Display for RegistryUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}{}",
            self.scheme.as_str(),
            self.host_port(),
            self.path
        )
    }
}

/// Canonical identifier for a user-supplied registry address
pub fn normalize(address: &str) -> Result<String> {
    RegistryUrl::parse(address).map(|u| u.canonical_identifier())
}

/// A `scheme://` prefix ahead of any path, query or fragment
fn has_scheme(address: &str) -> bool {
    let authority_end = address.find(['/', '?', '#']).unwrap_or(address.len());
    address
        .find("://")
        .is_some_and(|i| i <= authority_end && i > 0)
}

fn strip_scheme<'a>(address: &'a str, scheme: &str) -> Option<&'a str> {
    let (prefix, rest) = address.split_once("://")?;
    prefix.eq_ignore_ascii_case(scheme).then_some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_hub_aliases_share_identifier() {
        let expected = normalize("https://index.docker.io/v1/").unwrap();
        assert_eq!(expected, DOCKER_INDEX_SERVER);
        assert_eq!(normalize("docker.io").unwrap(), expected);
        assert_eq!(normalize("").unwrap(), expected);
        assert_eq!(normalize("  docker.io \n").unwrap(), expected);
    }

    #[test]
    fn test_default_port_and_scheme() {
        let expected = "registry.example.com:443";
        assert_eq!(normalize("registry.example.com").unwrap(), expected);
        assert_eq!(normalize("https://registry.example.com:443").unwrap(), expected);
        assert_eq!(normalize("https://registry.example.com/").unwrap(), expected);
    }

    #[test]
    fn test_http_is_upgraded() {
        assert_eq!(
            normalize("http://registry.example.com").unwrap(),
            "registry.example.com:443"
        );
        assert_eq!(
            normalize("HTTP://registry.example.com:8080").unwrap(),
            "registry.example.com:8080"
        );
        let url = RegistryUrl::parse("http://registry.example.com").unwrap();
        assert_eq!(url.scheme, RegistryScheme::Https);
    }

    #[test]
    fn test_explicit_port_is_kept() {
        assert_eq!(normalize("localhost:5000").unwrap(), "localhost:5000");
        assert_eq!(normalize("localhost:5001").unwrap(), "localhost:5001");
        assert_ne!(normalize("localhost:5000").unwrap(), normalize("localhost:5001").unwrap());
    }

    #[test]
    fn test_ipv6_host() {
        let url = RegistryUrl::parse("[::1]:5000").unwrap();
        assert_eq!(url.hostname(), "::1");
        assert_eq!(url.canonical_identifier(), "[::1]:5000");
    }

    #[test]
    fn test_unsupported_scheme() {
        let err = RegistryUrl::parse("ftp://registry.example.com").unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedScheme(s) if s == "ftp"));
    }

    #[test]
    fn test_unparsable_address() {
        let err = RegistryUrl::parse("https://exa mple.com").unwrap_err();
        assert!(matches!(err, BridgeError::UnparsableUrl(_)));
    }

    #[test]
    fn test_namespace_identifier() {
        let url = RegistryUrl::parse("mirror.example.com/v2/library?ns=docker.io").unwrap();
        let ns = url.namespace.as_deref().unwrap();
        assert_eq!(ns.canonical_identifier(), DOCKER_INDEX_SERVER);
        assert_eq!(
            url.canonical_identifier(),
            "nerdctl-experimental://https://index.docker.io/v1//host/mirror.example.com:443/v2/library"
        );
    }

    #[test]
    fn test_namespace_scheme_is_accepted() {
        let url = RegistryUrl::parse("nerdctl-experimental://mirror.example.com:5000").unwrap();
        assert_eq!(url.scheme, RegistryScheme::Namespace);
        assert_eq!(url.canonical_identifier(), "mirror.example.com:5000");
    }

    #[test]
    fn test_scheme_in_query_is_not_the_address_scheme() {
        assert!(!has_scheme("mirror.example.com?ns=https://index.docker.io/v1/"));
        assert!(!has_scheme("mirror.example.com/v2?ns=docker.io#x://y"));
        assert!(has_scheme("https://mirror.example.com"));

        let url =
            RegistryUrl::parse("mirror.example.com?ns=https://index.docker.io/v1/").unwrap();
        assert_eq!(url.host, "mirror.example.com");
        assert_eq!(
            url.namespace.as_deref().unwrap().canonical_identifier(),
            DOCKER_INDEX_SERVER
        );
    }

    #[test]
    fn test_invalid_namespace_is_rejected() {
        let err = RegistryUrl::parse("mirror.example.com?ns=ftp://other").unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedScheme(_)));
    }

    #[test]
    fn test_lookup_keys() {
        let url = RegistryUrl::parse("ghcr.io").unwrap();
        assert_eq!(url.lookup_keys(), vec!["ghcr.io:443", "ghcr.io"]);

        let hub = RegistryUrl::parse("docker.io").unwrap();
        assert_eq!(
            hub.lookup_keys(),
            vec![DOCKER_INDEX_SERVER, "index.docker.io:443", "index.docker.io"]
        );
    }

    #[test]
    fn test_display() {
        let url = RegistryUrl::parse("localhost:5000/v2/").unwrap();
        assert_eq!(url.to_string(), "https://localhost:5000/v2/");
    }
}
