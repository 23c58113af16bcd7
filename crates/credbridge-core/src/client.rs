//! In-VM bridge client
//!
//! One connection per operation: write the request, half-close, read the
//! reply until the bridge closes.

use crate::{
    address_file, connect, BridgeError, BridgeRequest, BridgeResponse, CredentialRecord, Endpoint,
    ProtocolError, Result,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// State root of the bridge as seen from the VM
pub const ROOT_ENV: &str = "CREDBRIDGE_ROOT";

/// Host operating system (`windows`, `darwin`, ...)
pub const HOST_OS_ENV: &str = "CREDBRIDGE_HOST_OS";

/// Forwarded socket inside the VM on non-Windows hosts
pub const VM_SOCKET_PATH: &str = "/run/credbridge-user-sockets/creds.sock";

/// Bridge address on a Windows host when no address file was published
pub const DEFAULT_BRIDGE_ADDR: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(Ipv4Addr::LOCALHOST),
    47365,
);

/// Default deadline for a whole round trip
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Reply larger than this is not a credential record
const MAX_RESPONSE_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct BridgeClient {
    endpoint: Endpoint,
    timeout: Duration,
}

impl BridgeClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Locate the bridge from the environment. `None` when no root is set,
    /// which callers treat as "no credentials available".
    pub fn from_env() -> Option<Self> {
        let root = std::env::var(ROOT_ENV).ok().filter(|r| !r.trim().is_empty())?;
        let host_os = std::env::var(HOST_OS_ENV).unwrap_or_default();
        Some(Self::new(Self::endpoint_for(&root, &host_os)))
    }

    /// Windows hosts listen on TCP and publish the address under the shared
    /// root; other hosts forward the socket to a fixed path inside the VM.
    pub fn endpoint_for(root: &str, host_os: &str) -> Endpoint {
        if host_os.eq_ignore_ascii_case("windows") {
            Endpoint::Tcp(published_address(Path::new(root)).unwrap_or(DEFAULT_BRIDGE_ADDR))
        } else {
            Endpoint::Unix(PathBuf::from(VM_SOCKET_PATH))
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// One round trip
    pub async fn request(&self, request: &BridgeRequest) -> Result<BridgeResponse> {
        let exchange = async {
            let mut stream = connect(&self.endpoint).await?;
            stream.write_all(&request.encode()).await?;
            stream.shutdown().await?;

            let mut reply = Vec::new();
            (&mut stream)
                .take(MAX_RESPONSE_BYTES)
                .read_to_end(&mut reply)
                .await?;
            Ok::<_, BridgeError>(reply)
        };

        let reply = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                BridgeError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no reply from {}", self.endpoint),
                ))
            })??;

        Ok(BridgeResponse::decode(
            &reply,
            request.command() == crate::Command::Get,
        )?)
    }

    /// The stored credential, or `None` when the bridge has nothing
    pub async fn get(&self, server_url: &str) -> Result<Option<CredentialRecord>> {
        let request = BridgeRequest::Get {
            server_url: server_url.to_string(),
        };
        match self.request(&request).await? {
            BridgeResponse::Record(record) if record.is_empty() => Ok(None),
            BridgeResponse::Record(record) => Ok(Some(record)),
            BridgeResponse::Empty => Ok(None),
            BridgeResponse::Error(reason) => Err(BridgeError::Remote(reason)),
        }
    }

    pub async fn store(&self, record: &CredentialRecord) -> Result<()> {
        self.expect_empty(&BridgeRequest::Store(record.clone())).await
    }

    pub async fn erase(&self, server_url: &str) -> Result<()> {
        self.expect_empty(&BridgeRequest::Erase {
            server_url: server_url.to_string(),
        })
        .await
    }

    pub async fn list(&self) -> Result<()> {
        self.expect_empty(&BridgeRequest::List).await
    }

    async fn expect_empty(&self, request: &BridgeRequest) -> Result<()> {
        match self.request(request).await? {
            BridgeResponse::Empty => Ok(()),
            BridgeResponse::Error(reason) => Err(BridgeError::Remote(reason)),
            BridgeResponse::Record(_) => Err(ProtocolError::MalformedResponse(format!(
                "unexpected record in reply to {}",
                request.command()
            ))
            .into()),
        }
    }
}

fn published_address(root: &Path) -> Option<SocketAddr> {
    let path = address_file(root);
    let content = std::fs::read_to_string(&path).ok()?;
    match content.trim().parse() {
        Ok(addr) => Some(addr),
        Err(e) => {
            tracing::warn!("Ignoring {}: {}", path.display(), e);
            None
        }
    }
}
