//! Maps backend results onto bridge replies
//!
//! `get` always answers with a record so the in-VM client can tell "no
//! credential" from a transport failure. The other commands answer with an
//! empty body on success or an `error:` line.

use crate::{BridgeError, BridgeResponse, Command, CredentialRecord, HelperOutcome};

/// Build the reply for one request.
///
/// `server_url` is what goes into the empty record for a `get` miss: the
/// canonical identifier, or the raw address when it could not be normalized.
pub fn translate(
    command: Command,
    server_url: &str,
    result: std::result::Result<HelperOutcome, BridgeError>,
) -> BridgeResponse {
    match command {
        Command::Get => match result {
            Ok(HelperOutcome::Found(record)) => BridgeResponse::Record(record),
            Ok(_) => BridgeResponse::Record(CredentialRecord::empty(server_url)),
            Err(e) => {
                if e.is_resolution() {
                    tracing::debug!("No credential source for {}: {}", server_url, e);
                } else {
                    tracing::warn!("get {} failed: {}", server_url, e);
                }
                BridgeResponse::Record(CredentialRecord::empty(server_url))
            }
        },
        Command::Store | Command::Erase => match result {
            Ok(_) => BridgeResponse::Empty,
            Err(e) => {
                tracing::warn!("{} {} failed: {}", command, server_url, e);
                BridgeResponse::error(e)
            }
        },
        Command::List => match result {
            Ok(_) => BridgeResponse::Empty,
            Err(e) if e.is_resolution() => {
                tracing::debug!("Nothing to list: {}", e);
                BridgeResponse::Empty
            }
            Err(e) => {
                tracing::warn!("list failed: {}", e);
                BridgeResponse::error(e)
            }
        },
    }
}
