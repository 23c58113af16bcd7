//! Bridge listener lifecycle and request dispatch
//!
//! A [`CredentialBridge`] owns at most one listener. Each accepted
//! connection carries exactly one request and one reply, handled on its own
//! task so a slow helper never blocks other clients.

use crate::transport::{inherited_stream, BridgeListener, BridgeStream};
use crate::{
    address_file, translate, AllowedNetwork, BridgeRequest, BridgeResponse, CredentialBackend,
    CredentialRecord, Endpoint, NativeBackend, ProtocolError, RegistryUrl, Result,
};
use credbridge_config::BridgeConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// How long `stop` waits for the accept loop to exit before aborting it
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Most input drained from a client whose request was too large
const MAX_DISCARD_BYTES: u64 = 1024 * 1024;

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeState::Stopped => write!(f, "stopped"),
            BridgeState::Starting => write!(f, "starting"),
            BridgeState::Listening => write!(f, "listening"),
            BridgeState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Per-connection bounds
#[derive(Debug, Clone, Copy)]
struct ConnectionLimits {
    read_timeout: Duration,
    max_request_bytes: usize,
}

/// Parses requests, normalizes their registry, and asks the backend
pub struct RequestHandler {
    backend: Arc<dyn CredentialBackend>,
}

impl RequestHandler {
    pub fn new(backend: Arc<dyn CredentialBackend>) -> Self {
        Self { backend }
    }

    /// Reply to the raw bytes of one read
    pub async fn handle_bytes(&self, bytes: &[u8]) -> BridgeResponse {
        match BridgeRequest::parse(bytes) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                tracing::debug!("Rejected request: {}", e);
                BridgeResponse::error(e)
            }
        }
    }

    pub async fn handle(&self, request: BridgeRequest) -> BridgeResponse {
        let command = request.command();
        tracing::debug!("{} {}", command, request.server_url());

        match request {
            BridgeRequest::List => translate(command, "", self.backend.list().await),
            BridgeRequest::Get { server_url } => match RegistryUrl::parse(&server_url) {
                Ok(registry) => {
                    let id = registry.canonical_identifier();
                    translate(command, &id, self.backend.get(&registry).await)
                }
                Err(e) => translate(command, &server_url, Err(e)),
            },
            BridgeRequest::Erase { server_url } => match RegistryUrl::parse(&server_url) {
                Ok(registry) => {
                    let id = registry.canonical_identifier();
                    translate(command, &id, self.backend.erase(&registry).await)
                }
                Err(e) => translate(command, &server_url, Err(e)),
            },
            BridgeRequest::Store(record) => match RegistryUrl::parse(&record.server_url) {
                Ok(registry) => {
                    let id = registry.canonical_identifier();
                    let record = CredentialRecord {
                        server_url: id.clone(),
                        ..record
                    };
                    translate(command, &id, self.backend.store(&registry, &record).await)
                }
                Err(e) => translate(command, &record.server_url, Err(e)),
            },
        }
    }
}

struct ActiveListener {
    endpoint: Endpoint,
    /// Address file published under the state root for TCP endpoints
    address_file: Option<PathBuf>,
    task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// A credential bridge service. Several may coexist, each with its own
/// endpoint.
pub struct CredentialBridge {
    config: BridgeConfig,
    handler: Arc<RequestHandler>,
    active: Mutex<Option<ActiveListener>>,
    state: watch::Sender<BridgeState>,
}

impl CredentialBridge {
    pub fn new(config: BridgeConfig, backend: Arc<dyn CredentialBackend>) -> Self {
        let (state, _) = watch::channel(BridgeState::Stopped);
        Self {
            config,
            handler: Arc::new(RequestHandler::new(backend)),
            active: Mutex::new(None),
            state,
        }
    }

    /// Bridge backed by the host's credential helpers
    pub fn native(config: BridgeConfig, root: &Path) -> Self {
        let backend = NativeBackend::from_config(&config, root);
        Self::new(config, Arc::new(backend))
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    /// Where the bridge is listening, if it is
    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.active.lock().await.as_ref().map(|a| a.endpoint.clone())
    }

    /// Start listening on the configured transport for a state root.
    /// Succeeds immediately if already listening. A TCP endpoint's bound
    /// address is written to `<root>/sock/creds.addr` for clients that only
    /// see the state root.
    pub async fn start(&self, root: &Path) -> Result<()> {
        let endpoint = Endpoint::for_root(root, &self.config)?;
        self.start_inner(endpoint, Some(root)).await
    }

    /// Start listening on an explicit endpoint
    pub async fn start_at(&self, endpoint: Endpoint) -> Result<()> {
        self.start_inner(endpoint, None).await
    }

    async fn start_inner(&self, endpoint: Endpoint, root: Option<&Path>) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            tracing::debug!("Bridge already listening on {}", current.endpoint);
            return Ok(());
        }

        self.state.send_replace(BridgeState::Starting);
        let bound = match self.bind(&endpoint).await {
            Ok(bound) => bound,
            Err(e) => {
                self.state.send_replace(BridgeState::Stopped);
                return Err(e);
            }
        };
        let (listener, endpoint) = bound;

        let address_file = match (&endpoint, root) {
            (Endpoint::Tcp(addr), Some(root)) => match publish_address(root, addr) {
                Ok(path) => Some(path),
                Err(e) => {
                    self.state.send_replace(BridgeState::Stopped);
                    return Err(e);
                }
            },
            _ => None,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            self.handler.clone(),
            self.limits(),
            shutdown_rx,
        ));

        tracing::info!("Credential bridge listening on {}", endpoint);
        *active = Some(ActiveListener {
            endpoint,
            address_file,
            task,
            shutdown_tx,
        });
        self.state.send_replace(BridgeState::Listening);
        Ok(())
    }

    async fn bind(&self, endpoint: &Endpoint) -> Result<(BridgeListener, Endpoint)> {
        let allowed = match endpoint {
            Endpoint::Tcp(_) => AllowedNetwork::parse_all(&self.config.tcp.allowed_networks)?,
            _ => Vec::new(),
        };
        let listener = BridgeListener::bind(endpoint, allowed).await?;
        // Report the real port when bound to port 0
        let endpoint = match &listener {
            BridgeListener::Tcp { listener, .. } => Endpoint::Tcp(listener.local_addr()?),
            #[allow(unreachable_patterns)]
            _ => endpoint.clone(),
        };
        Ok((listener, endpoint))
    }

    fn limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            read_timeout: self.config.read_timeout(),
            max_request_bytes: self.config.max_request_bytes(),
        }
    }

    /// Stop listening and remove the endpoint file. Connections already
    /// accepted run to completion. Safe to call in any state.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        let Some(mut listener) = active.take() else {
            return;
        };

        self.state.send_replace(BridgeState::Stopping);
        let _ = listener.shutdown_tx.send(true);
        if tokio::time::timeout(STOP_GRACE, &mut listener.task)
            .await
            .is_err()
        {
            listener.task.abort();
        }
        remove_endpoint_files(&listener);

        tracing::info!("Credential bridge on {} stopped", listener.endpoint);
        self.state.send_replace(BridgeState::Stopped);
    }

    /// Serve the single connection inherited on stdin (inetd/launchd style)
    pub async fn serve_inherited(&self) -> Result<()> {
        let stream = inherited_stream()?;
        serve_connection(stream, &self.handler, self.limits()).await
    }
}

impl Drop for CredentialBridge {
    fn drop(&mut self) {
        if let Some(listener) = self.active.get_mut().take() {
            let _ = listener.shutdown_tx.send(true);
            listener.task.abort();
            remove_endpoint_files(&listener);
        }
    }
}

fn publish_address(root: &Path, addr: &std::net::SocketAddr) -> Result<PathBuf> {
    let path = address_file(root);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&path, addr.to_string())?;
    Ok(path)
}

fn remove_endpoint_files(listener: &ActiveListener) {
    let socket = match &listener.endpoint {
        Endpoint::Unix(path) => Some(path),
        _ => None,
    };
    for path in socket.into_iter().chain(listener.address_file.as_ref()) {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}

async fn accept_loop(
    mut listener: BridgeListener,
    handler: Arc<RequestHandler>,
    limits: ConnectionLimits,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("Bridge shutdown signal received");
                    break;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok(Some(stream)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, &handler, limits).await {
                                tracing::debug!("Connection error: {}", e);
                            }
                        });
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!("Accept error (continuing): {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                }
            }
        }
    }
}

/// One read, one reply, close
async fn serve_connection(
    mut stream: Box<dyn BridgeStream>,
    handler: &RequestHandler,
    limits: ConnectionLimits,
) -> Result<()> {
    let mut buf = vec![0u8; limits.max_request_bytes.saturating_add(1)];
    let n = match tokio::time::timeout(limits.read_timeout, stream.read(&mut buf)).await {
        Ok(read) => read?,
        Err(_) => {
            tracing::debug!("Timed out waiting for request");
            return Ok(());
        }
    };
    if n == 0 {
        return Ok(());
    }

    let response = if n > limits.max_request_bytes {
        // Closing with unread input would reset the connection before the
        // client sees the reply
        let mut limited = (&mut stream).take(MAX_DISCARD_BYTES);
        let mut sink = tokio::io::sink();
        let drain = tokio::io::copy(&mut limited, &mut sink);
        let _ = tokio::time::timeout(limits.read_timeout, drain).await;
        BridgeResponse::error(ProtocolError::TooLarge(limits.max_request_bytes))
    } else {
        handler.handle_bytes(&buf[..n]).await
    };

    stream.write_all(&response.encode()?).await?;
    stream.shutdown().await?;
    Ok(())
}
