//! Registry login verification
//!
//! Checks a username/secret against a registry before it is stored, using
//! the Docker v2 auth flow:
//! 1. GET /v2/ with basic auth
//! 2. On 401 with a Bearer challenge, GET <realm>?service=<service> with the
//!    same basic auth and expect a token

use crate::{BridgeError, RegistryUrl, Result};
use std::collections::HashMap;
use std::time::Duration;

const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";
const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A parsed `WWW-Authenticate` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
    },
}

/// Base URL for the registry API. Loopback registries are plain http.
pub fn api_base_url(registry: &RegistryUrl) -> String {
    if registry.canonical_identifier() == crate::DOCKER_INDEX_SERVER {
        return format!("https://{}", DOCKER_HUB_API_HOST);
    }
    let scheme = if is_loopback(registry.hostname()) {
        "http"
    } else {
        "https"
    };
    format!("{}://{}", scheme, registry.host_port())
}

fn is_loopback(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

/// Verify credentials against the registry
pub async fn verify_login(registry: &RegistryUrl, username: &str, secret: &str) -> Result<()> {
    let mut builder = reqwest::Client::builder().timeout(LOGIN_TIMEOUT);
    if is_loopback(registry.hostname()) {
        builder = builder.no_proxy();
    }
    let client = builder
        .build()
        .map_err(|e| BridgeError::Login(format!("failed to build HTTP client: {}", e)))?;

    let v2_url = format!("{}/v2/", api_base_url(registry));
    tracing::debug!("Verifying login for {} against {}", username, v2_url);

    let resp = client
        .get(&v2_url)
        .basic_auth(username, Some(secret))
        .send()
        .await
        .map_err(|e| BridgeError::Login(format!("failed to reach registry: {}", e)))?;

    if resp.status().is_success() {
        return Ok(());
    }
    if resp.status() != reqwest::StatusCode::UNAUTHORIZED {
        return Err(BridgeError::Login(format!(
            "registry returned {}",
            resp.status()
        )));
    }

    let challenge = resp
        .headers()
        .get("www-authenticate")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| BridgeError::Login("no WWW-Authenticate header in 401 response".into()))
        .and_then(parse_challenge)?;

    let (realm, service) = match challenge {
        AuthChallenge::Basic => {
            return Err(BridgeError::Login("unauthorized: incorrect username or password".into()))
        }
        AuthChallenge::Bearer { realm, service } => (realm, service),
    };

    let mut token_req = client.get(&realm).basic_auth(username, Some(secret));
    if let Some(service) = &service {
        token_req = token_req.query(&[("service", service)]);
    }
    let token_resp = token_req
        .send()
        .await
        .map_err(|e| BridgeError::Login(format!("token request failed: {}", e)))?;

    if !token_resp.status().is_success() {
        return Err(BridgeError::Login(format!(
            "token endpoint returned {}",
            token_resp.status()
        )));
    }

    let token_json: serde_json::Value = token_resp
        .json()
        .await
        .map_err(|e| BridgeError::Login(format!("failed to parse token response: {}", e)))?;
    let has_token = ["token", "access_token"]
        .iter()
        .any(|k| token_json.get(k).and_then(|t| t.as_str()).is_some_and(|t| !t.is_empty()));
    if !has_token {
        return Err(BridgeError::Login("no token in response".into()));
    }
    Ok(())
}

/// Parse a `WWW-Authenticate` header value
pub fn parse_challenge(header: &str) -> Result<AuthChallenge> {
    let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));

    if scheme.eq_ignore_ascii_case("basic") {
        return Ok(AuthChallenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(BridgeError::Login(format!("unexpected auth scheme: {}", header)));
    }

    let parsed: HashMap<String, String> = params
        .split(',')
        .filter_map(|part| {
            let (key, value) = part.trim().split_once('=')?;
            Some((
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect();

    let realm = parsed
        .get("realm")
        .filter(|r| !r.is_empty())
        .ok_or_else(|| BridgeError::Login("missing realm in WWW-Authenticate".into()))?
        .clone();

    Ok(AuthChallenge::Bearer {
        realm,
        service: parsed.get("service").cloned(),
    })
}
