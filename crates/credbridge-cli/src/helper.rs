//! `docker-credential-credbridge`: the credential-helper protocol over the bridge
//!
//! Tools inside the VM run `docker-credential-credbridge <verb>` with the
//! operand on stdin, exactly as they would a native helper. Every verb is
//! forwarded to the host bridge.

use credbridge_core::{BridgeClient, BridgeError, CredentialRecord};
use thiserror::Error;

/// What native helpers print for a missing credential
pub const NOT_FOUND_MESSAGE: &str = "credentials not found in native keychain";

#[derive(Error, Debug)]
pub enum HelperError {
    #[error("{}", NOT_FOUND_MESSAGE)]
    NotFound,

    #[error("unknown verb: {0}")]
    UnknownVerb(String),

    #[error("no server URL on stdin")]
    MissingServerUrl,

    #[error("invalid credential payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("credbridge is not configured: set {}", credbridge_core::ROOT_ENV)]
    NotConfigured,

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Run one helper verb. Returns what goes to stdout on success.
pub async fn execute(
    verb: &str,
    client: Option<&BridgeClient>,
    input: &str,
) -> Result<String, HelperError> {
    match verb {
        "get" => {
            let server_url = server_url(input)?;
            // No bridge means no credentials, not a failure
            let Some(client) = client else {
                return Err(HelperError::NotFound);
            };
            match client.get(&server_url).await {
                Ok(Some(record)) => Ok(serde_json::to_string(&record)?),
                Ok(None) => Err(HelperError::NotFound),
                Err(e) => {
                    tracing::warn!("Bridge lookup for {} failed: {}", server_url, e);
                    Err(HelperError::NotFound)
                }
            }
        }
        "store" => {
            let record: CredentialRecord = serde_json::from_str(input.trim())?;
            if record.server_url.trim().is_empty() {
                return Err(HelperError::MissingServerUrl);
            }
            client
                .ok_or(HelperError::NotConfigured)?
                .store(&record)
                .await?;
            Ok(String::new())
        }
        "erase" => {
            let server_url = server_url(input)?;
            client
                .ok_or(HelperError::NotConfigured)?
                .erase(&server_url)
                .await?;
            Ok(String::new())
        }
        "list" => {
            if let Some(client) = client {
                client.list().await?;
            }
            Ok("{}".to_string())
        }
        "version" => Ok(format!(
            "docker-credential-credbridge {}",
            env!("CARGO_PKG_VERSION")
        )),
        other => Err(HelperError::UnknownVerb(other.to_string())),
    }
}

fn server_url(input: &str) -> Result<String, HelperError> {
    let server_url = input.trim();
    if server_url.is_empty() {
        return Err(HelperError::MissingServerUrl);
    }
    Ok(server_url.to_string())
}
