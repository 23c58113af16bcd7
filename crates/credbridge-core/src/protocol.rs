//! Bridge wire protocol
//!
//! A request is a handful of newline-separated lines sent in one write:
//!
//! ```text
//! get\n<server>          erase\n<server>
//! store\n<server>\n<username>\n<secret>
//! list
//! ```
//!
//! The reply is a JSON credential record for `get`, an empty body for the
//! other commands, or `error: <reason>`. One request per connection.

use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Default bound on a single request read
pub const MAX_REQUEST_BYTES: usize = 4096;

/// Prefix of every error reply
pub const ERROR_PREFIX: &str = "error: ";

/// The credential-helper verb set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Get,
    Store,
    Erase,
    List,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Get => "get",
            Command::Store => "store",
            Command::Erase => "erase",
            Command::List => "list",
        }
    }

    /// Number of lines a request for this command carries, command included
    pub fn arity(&self) -> usize {
        match self {
            Command::Get | Command::Erase => 2,
            Command::Store => 4,
            Command::List => 1,
        }
    }
}

impl std::str::FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "get" => Ok(Command::Get),
            "store" => Ok(Command::Store),
            "erase" => Ok(Command::Erase),
            "list" => Ok(Command::List),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registry's stored credential, in the credential-helper JSON shape.
///
/// Empty username and secret together mean "no credential".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(rename = "ServerURL", default)]
    pub server_url: String,
    #[serde(rename = "Username", default)]
    pub username: String,
    #[serde(rename = "Secret", default)]
    pub secret: String,
}

impl CredentialRecord {
    pub fn new(
        server_url: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            username: username.into(),
            secret: secret.into(),
        }
    }

    /// The "not found" record for a server
    pub fn empty(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.secret.is_empty()
    }
}

/// A parsed bridge request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeRequest {
    Get { server_url: String },
    Store(CredentialRecord),
    Erase { server_url: String },
    List,
}

impl BridgeRequest {
    pub fn command(&self) -> Command {
        match self {
            BridgeRequest::Get { .. } => Command::Get,
            BridgeRequest::Store(_) => Command::Store,
            BridgeRequest::Erase { .. } => Command::Erase,
            BridgeRequest::List => Command::List,
        }
    }

    pub fn server_url(&self) -> &str {
        match self {
            BridgeRequest::Get { server_url } | BridgeRequest::Erase { server_url } => server_url,
            BridgeRequest::Store(record) => &record.server_url,
            BridgeRequest::List => "",
        }
    }

    /// Parse the bytes of a single read
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;

        let mut lines: Vec<&str> = text.split('\n').map(str::trim).collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        if lines.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let command: Command = lines[0].parse()?;
        if lines.len() != command.arity() {
            return Err(ProtocolError::Arity {
                command: command.to_string(),
                expected: command.arity(),
                actual: lines.len(),
            });
        }

        let request = match command {
            Command::Get => BridgeRequest::Get {
                server_url: lines[1].to_string(),
            },
            Command::Erase => BridgeRequest::Erase {
                server_url: lines[1].to_string(),
            },
            Command::List => BridgeRequest::List,
            Command::Store => {
                let record = CredentialRecord::new(lines[1], lines[2], lines[3]);
                if record.username.is_empty() || record.secret.is_empty() {
                    return Err(ProtocolError::IncompleteCredential);
                }
                BridgeRequest::Store(record)
            }
        };
        Ok(request)
    }

    /// Serialize for sending. Embedded line breaks are stripped from every
    /// field since the format cannot carry them.
    pub fn encode(&self) -> Vec<u8> {
        let mut lines = vec![self.command().as_str().to_string()];
        match self {
            BridgeRequest::Get { server_url } | BridgeRequest::Erase { server_url } => {
                lines.push(sanitize_field(server_url));
            }
            BridgeRequest::Store(record) => {
                lines.push(sanitize_field(&record.server_url));
                lines.push(sanitize_field(&record.username));
                lines.push(sanitize_field(&record.secret));
            }
            BridgeRequest::List => {}
        }
        let mut out = lines.join("\n");
        out.push('\n');
        out.into_bytes()
    }
}

/// Remove characters that would break field boundaries
pub fn sanitize_field(value: &str) -> String {
    value.chars().filter(|c| *c != '\n' && *c != '\r').collect()
}

/// What the bridge writes back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeResponse {
    Record(CredentialRecord),
    Empty,
    Error(String),
}

impl BridgeResponse {
    pub fn error(reason: impl std::fmt::Display) -> Self {
        BridgeResponse::Error(reason.to_string())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            BridgeResponse::Record(record) => serde_json::to_vec(record)?,
            BridgeResponse::Empty => Vec::new(),
            BridgeResponse::Error(reason) => {
                format!("{}{}", ERROR_PREFIX, sanitize_field(reason)).into_bytes()
            }
        })
    }

    /// Decode a reply. `expect_record` selects how a JSON body is read.
    pub fn decode(bytes: &[u8], expect_record: bool) -> std::result::Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        let text = text.trim();

        if let Some(reason) = text.strip_prefix(ERROR_PREFIX.trim_end()) {
            return Ok(BridgeResponse::Error(reason.trim().to_string()));
        }
        if text.is_empty() {
            return Ok(BridgeResponse::Empty);
        }
        if !expect_record {
            return Err(ProtocolError::MalformedResponse(
                "unexpected body".to_string(),
            ));
        }
        serde_json::from_str(text)
            .map(BridgeResponse::Record)
            .map_err(|e| ProtocolError::MalformedResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get() {
        let req = BridgeRequest::parse(b"get\nlocalhost:5000\n").unwrap();
        assert_eq!(
            req,
            BridgeRequest::Get {
                server_url: "localhost:5000".to_string()
            }
        );
    }

    #[test]
    fn test_parse_trims_whitespace_and_cr() {
        let req = BridgeRequest::parse(b"  erase \r\n\tghcr.io \r\n").unwrap();
        assert_eq!(
            req,
            BridgeRequest::Erase {
                server_url: "ghcr.io".to_string()
            }
        );
    }

    #[test]
    fn test_parse_store() {
        let req = BridgeRequest::parse(b"store\nlocalhost:5000\ntestUser\ntestPassword").unwrap();
        assert_eq!(
            req,
            BridgeRequest::Store(CredentialRecord::new(
                "localhost:5000",
                "testUser",
                "testPassword"
            ))
        );
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(BridgeRequest::parse(b"list\n").unwrap(), BridgeRequest::List);
    }

    #[test]
    fn test_unknown_command() {
        let err = BridgeRequest::parse(b"bogus\nfoo").unwrap_err();
        assert_eq!(err, ProtocolError::UnknownCommand("bogus".to_string()));
    }

    #[test]
    fn test_arity_mismatch() {
        let err = BridgeRequest::parse(b"get\n").unwrap_err();
        assert!(matches!(err, ProtocolError::Arity { expected: 2, actual: 1, .. }));

        let err = BridgeRequest::parse(b"get\na\nb").unwrap_err();
        assert!(matches!(err, ProtocolError::Arity { expected: 2, actual: 3, .. }));

        let err = BridgeRequest::parse(b"list\nextra").unwrap_err();
        assert!(matches!(err, ProtocolError::Arity { expected: 1, actual: 2, .. }));

        let err = BridgeRequest::parse(b"store\nhost\nuser").unwrap_err();
        assert!(matches!(err, ProtocolError::Arity { expected: 4, actual: 3, .. }));
    }

    #[test]
    fn test_store_rejects_partial_record() {
        let err = BridgeRequest::parse(b"store\nhost\n\nsecret").unwrap_err();
        assert_eq!(err, ProtocolError::IncompleteCredential);
    }

    #[test]
    fn test_empty_and_binary_requests() {
        assert_eq!(BridgeRequest::parse(b"").unwrap_err(), ProtocolError::Empty);
        assert_eq!(BridgeRequest::parse(b"\n\r\n  ").unwrap_err(), ProtocolError::Empty);
        assert_eq!(
            BridgeRequest::parse(&[0xff, 0xfe, b'\n']).unwrap_err(),
            ProtocolError::InvalidUtf8
        );
    }

    #[test]
    fn test_encode_strips_line_breaks() {
        let req = BridgeRequest::Store(CredentialRecord::new("host\n", "us\rer", "se\ncret"));
        assert_eq!(req.encode(), b"store\nhost\nuser\nsecret\n".to_vec());
        assert_eq!(BridgeRequest::parse(&req.encode()).unwrap(), BridgeRequest::Store(
            CredentialRecord::new("host", "user", "secret")
        ));
    }

    #[test]
    fn test_record_json_shape() {
        let record = CredentialRecord::new("localhost:5000", "testUser", "testPassword");
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"ServerURL":"localhost:5000","Username":"testUser","Secret":"testPassword"}"#
        );
        assert!(CredentialRecord::empty("localhost:5001").is_empty());
    }

    #[test]
    fn test_response_encoding() {
        assert!(BridgeResponse::Empty.encode().unwrap().is_empty());
        assert_eq!(
            BridgeResponse::error("unknown command: bogus").encode().unwrap(),
            b"error: unknown command: bogus".to_vec()
        );
    }

    #[test]
    fn test_response_decoding() {
        assert_eq!(
            BridgeResponse::decode(b"error: unknown command: bogus", false).unwrap(),
            BridgeResponse::Error("unknown command: bogus".to_string())
        );
        assert_eq!(BridgeResponse::decode(b"", false).unwrap(), BridgeResponse::Empty);
        assert_eq!(
            BridgeResponse::decode(br#"{"ServerURL":"h","Username":"u","Secret":"s"}"#, true)
                .unwrap(),
            BridgeResponse::Record(CredentialRecord::new("h", "u", "s"))
        );
        assert!(BridgeResponse::decode(b"not json", true).is_err());
    }
}
