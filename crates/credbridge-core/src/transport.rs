//! Bridge endpoints
//!
//! Three ways to expose the bridge to the VM:
//! - a unix socket at `<root>/sock/creds.sock` (mode 0600, directory 0750)
//! - a named pipe derived from the root, owner and SYSTEM only (Windows)
//! - a TCP listener that drops peers outside an allow-list; its bound address
//!   is published at `<root>/sock/creds.addr`

use crate::{BridgeError, Result};
use credbridge_config::{BridgeConfig, ConfigError, TransportKind};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};

/// Directory under the state root holding the socket
pub const SOCKET_DIR: &str = "sock";

/// Socket file name
pub const SOCKET_NAME: &str = "creds.sock";

/// File holding a TCP endpoint's bound address
pub const ADDRESS_FILE: &str = "creds.addr";

/// Prefix of pipe names
pub const PIPE_PREFIX: &str = r"\\.\pipe\credbridge-";

/// Deadline for the liveness probe against an existing socket file
pub const PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(500);

/// A connected byte stream, whatever the transport
pub trait BridgeStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BridgeStream for T {}

/// Where the bridge listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Pipe(String),
    Tcp(SocketAddr),
}

impl Endpoint {
    /// Endpoint for a state root under the configured transport
    pub fn for_root(root: &Path, config: &BridgeConfig) -> Result<Self> {
        Ok(match config.bridge.transport {
            TransportKind::Unix => Endpoint::Unix(socket_path(root)),
            TransportKind::Pipe => Endpoint::Pipe(pipe_name(root)),
            TransportKind::Tcp => {
                let listen = &config.tcp.listen;
                let addr = listen
                    .parse()
                    .map_err(|source| ConfigError::InvalidListenAddress {
                        value: listen.clone(),
                        source,
                    })?;
                Endpoint::Tcp(addr)
            }
        })
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Endpoint::Unix(_) => TransportKind::Unix,
            Endpoint::Pipe(_) => TransportKind::Pipe,
            Endpoint::Tcp(_) => TransportKind::Tcp,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Pipe(name) => write!(f, "pipe:{}", name),
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// `<root>/sock/creds.sock`
pub fn socket_path(root: &Path) -> PathBuf {
    root.join(SOCKET_DIR).join(SOCKET_NAME)
}

/// `<root>/sock/creds.addr`
pub fn address_file(root: &Path) -> PathBuf {
    root.join(SOCKET_DIR).join(ADDRESS_FILE)
}

/// Pipe name unique to a state root
pub fn pipe_name(root: &Path) -> String {
    let suffix: String = root
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{}{}", PIPE_PREFIX, suffix.trim_matches('-'))
}

/// An IPv4 or IPv6 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedNetwork {
    network: IpAddr,
    prefix_len: u8,
}

impl AllowedNetwork {
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.network, unmap(*addr)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix_len);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix_len);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }

    /// Parse a list of CIDR strings from configuration
    pub fn parse_all(networks: &[String]) -> Result<Vec<Self>> {
        networks
            .iter()
            .map(|n| n.parse().map_err(BridgeError::from))
            .collect()
    }
}

impl std::str::FromStr for AllowedNetwork {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidNetwork(s.to_string());
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s.trim(), None),
        };
        let network: IpAddr = addr.parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix_len > max {
            return Err(invalid());
        }
        Ok(Self {
            network,
            prefix_len,
        })
    }
}

impl std::fmt::Display for AllowedNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    }
}

fn prefix_mask_u32(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(len))
    }
}

fn prefix_mask_u128(len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(len))
    }
}

/// A bound listener for one endpoint
pub(crate) enum BridgeListener {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    #[cfg(windows)]
    Pipe {
        name: String,
        security: pipe_security::OwnerOnly,
        next: tokio::net::windows::named_pipe::NamedPipeServer,
    },
    Tcp {
        listener: tokio::net::TcpListener,
        allowed: Vec<AllowedNetwork>,
    },
}

impl BridgeListener {
    /// Bind the endpoint. A stale socket file left by a dead bridge is
    /// replaced; a live one is reported as in use.
    pub(crate) async fn bind(endpoint: &Endpoint, allowed: Vec<AllowedNetwork>) -> Result<Self> {
        match endpoint {
            Endpoint::Unix(path) => bind_unix(path).await,
            Endpoint::Pipe(name) => bind_pipe(name),
            Endpoint::Tcp(addr) => {
                let listener = tokio::net::TcpListener::bind(*addr).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AddrInUse {
                        BridgeError::EndpointInUse(addr.to_string())
                    } else {
                        BridgeError::Io(e)
                    }
                })?;
                Ok(BridgeListener::Tcp { listener, allowed })
            }
        }
    }

    /// Wait for the next client. `None` means a peer was turned away.
    pub(crate) async fn accept(&mut self) -> std::io::Result<Option<Box<dyn BridgeStream>>> {
        match self {
            #[cfg(unix)]
            BridgeListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Some(Box::new(stream)))
            }
            #[cfg(windows)]
            BridgeListener::Pipe {
                name,
                security,
                next,
            } => {
                next.connect().await?;
                let replacement = security.create(name, false)?;
                let connected = std::mem::replace(next, replacement);
                Ok(Some(Box::new(connected)))
            }
            BridgeListener::Tcp { listener, allowed } => {
                let (stream, peer) = listener.accept().await?;
                if !allowed.iter().any(|n| n.contains(&peer.ip())) {
                    tracing::warn!("Rejected connection from {}: not in allowed networks", peer);
                    return Ok(None);
                }
                Ok(Some(Box::new(stream)))
            }
        }
    }
}

#[cfg(unix)]
async fn bind_unix(path: &Path) -> Result<BridgeListener> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750))?;
    }

    if path.exists() {
        let probe = tokio::time::timeout(PROBE_TIMEOUT, tokio::net::UnixStream::connect(path)).await;
        if matches!(probe, Ok(Ok(_))) {
            return Err(BridgeError::EndpointInUse(path.display().to_string()));
        }
        tracing::debug!("Removing stale socket {}", path.display());
        std::fs::remove_file(path)?;
    }

    let listener = tokio::net::UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(BridgeListener::Unix(listener))
}

#[cfg(not(unix))]
async fn bind_unix(path: &Path) -> Result<BridgeListener> {
    Err(BridgeError::UnsupportedPlatform(format!(
        "unix sockets ({})",
        path.display()
    )))
}

#[cfg(windows)]
fn bind_pipe(name: &str) -> Result<BridgeListener> {
    let security = pipe_security::OwnerOnly::new()?;
    let next = security.create(name, true).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            BridgeError::EndpointInUse(name.to_string())
        } else {
            BridgeError::Io(e)
        }
    })?;
    Ok(BridgeListener::Pipe {
        name: name.to_string(),
        security,
        next,
    })
}

#[cfg(windows)]
mod pipe_security {
    use std::ffi::c_void;
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
    use windows_sys::Win32::Foundation::LocalFree;
    use windows_sys::Win32::Security::Authorization::{
        ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
    };
    use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;

    /// Protected DACL: full access for SYSTEM and the owner, nobody else
    const OWNER_ONLY_SDDL: &str = "D:P(A;;GA;;;SY)(A;;GA;;;OW)";

    /// Security descriptor applied to every pipe instance
    pub(super) struct OwnerOnly {
        descriptor: *mut c_void,
    }

    // The descriptor is only read after construction and freed once on drop
    unsafe impl Send for OwnerOnly {}
    unsafe impl Sync for OwnerOnly {}

    impl OwnerOnly {
        pub(super) fn new() -> std::io::Result<Self> {
            let sddl: Vec<u16> = OWNER_ONLY_SDDL
                .encode_utf16()
                .chain(std::iter::once(0))
                .collect();
            let mut descriptor: *mut c_void = std::ptr::null_mut();
            let ok = unsafe {
                ConvertStringSecurityDescriptorToSecurityDescriptorW(
                    sddl.as_ptr(),
                    SDDL_REVISION_1,
                    &mut descriptor,
                    std::ptr::null_mut(),
                )
            };
            if ok == 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(Self { descriptor })
        }

        pub(super) fn create(&self, name: &str, first: bool) -> std::io::Result<NamedPipeServer> {
            let mut attributes = SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: self.descriptor,
                bInheritHandle: 0,
            };
            unsafe {
                ServerOptions::new()
                    .first_pipe_instance(first)
                    .reject_remote_clients(true)
                    .create_with_security_attributes_raw(
                        name,
                        &mut attributes as *mut SECURITY_ATTRIBUTES as *mut c_void,
                    )
            }
        }
    }

    impl Drop for OwnerOnly {
        fn drop(&mut self) {
            unsafe {
                LocalFree(self.descriptor);
            }
        }
    }
}

#[cfg(not(windows))]
fn bind_pipe(name: &str) -> Result<BridgeListener> {
    Err(BridgeError::UnsupportedPlatform(format!("named pipes ({})", name)))
}

/// Open a client connection to an endpoint
pub async fn connect(endpoint: &Endpoint) -> std::io::Result<Box<dyn BridgeStream>> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => Ok(Box::new(tokio::net::UnixStream::connect(path).await?)),
        #[cfg(windows)]
        Endpoint::Pipe(name) => connect_pipe(name).await,
        Endpoint::Tcp(addr) => Ok(Box::new(tokio::net::TcpStream::connect(*addr).await?)),
        #[allow(unreachable_patterns)]
        other => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("{} is not available on this platform", other),
        )),
    }
}

#[cfg(windows)]
async fn connect_pipe(name: &str) -> std::io::Result<Box<dyn BridgeStream>> {
    use tokio::net::windows::named_pipe::ClientOptions;
    const ERROR_PIPE_BUSY: i32 = 231;

    for _ in 0..50 {
        match ClientOptions::new().open(name) {
            Ok(client) => return Ok(Box::new(client)),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("pipe {} stayed busy", name),
    ))
}

/// Whether something is accepting connections at the endpoint
pub async fn is_live(endpoint: &Endpoint) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, connect(endpoint)).await,
        Ok(Ok(_))
    )
}

/// The connection inherited on stdin when started by inetd or launchd
#[cfg(unix)]
pub fn inherited_stream() -> Result<Box<dyn BridgeStream>> {
    use std::os::fd::AsFd;

    let fd = std::io::stdin().as_fd().try_clone_to_owned()?;
    let stream = std::os::unix::net::UnixStream::from(fd);
    stream.set_nonblocking(true)?;
    Ok(Box::new(tokio::net::UnixStream::from_std(stream)?))
}

#[cfg(not(unix))]
pub fn inherited_stream() -> Result<Box<dyn BridgeStream>> {
    Err(BridgeError::UnsupportedPlatform(
        "inherited connections".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> AllowedNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn test_allowed_network_contains() {
        let loopback = net("127.0.0.0/8");
        assert!(loopback.contains(&"127.0.0.1".parse().unwrap()));
        assert!(loopback.contains(&"127.255.0.9".parse().unwrap()));
        assert!(!loopback.contains(&"128.0.0.1".parse().unwrap()));

        let vm = net("192.168.5.0/24");
        assert!(vm.contains(&"192.168.5.2".parse().unwrap()));
        assert!(!vm.contains(&"192.168.6.2".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_mapped_peer_matches_v4_network() {
        assert!(net("127.0.0.0/8").contains(&"::ffff:127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_network() {
        let v6 = net("::1/128");
        assert!(v6.contains(&"::1".parse().unwrap()));
        assert!(!v6.contains(&"::2".parse().unwrap()));
        assert!(!v6.contains(&"127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_bare_address_and_zero_prefix() {
        assert_eq!(net("10.0.0.1").to_string(), "10.0.0.1/32");
        assert!(net("0.0.0.0/0").contains(&"203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn test_invalid_networks() {
        assert!("10.0.0.0/33".parse::<AllowedNetwork>().is_err());
        assert!("not-an-ip/8".parse::<AllowedNetwork>().is_err());
        assert!("10.0.0.0/x".parse::<AllowedNetwork>().is_err());
        assert!(AllowedNetwork::parse_all(&["127.0.0.0/8".into(), "bogus".into()]).is_err());
    }

    #[test]
    fn test_endpoint_for_root() {
        let root = Path::new("/var/lib/credbridge");
        let mut config = BridgeConfig::default();

        config.bridge.transport = TransportKind::Unix;
        assert_eq!(
            Endpoint::for_root(root, &config).unwrap(),
            Endpoint::Unix(PathBuf::from("/var/lib/credbridge/sock/creds.sock"))
        );

        config.bridge.transport = TransportKind::Pipe;
        assert_eq!(
            Endpoint::for_root(root, &config).unwrap(),
            Endpoint::Pipe(r"\\.\pipe\credbridge-var-lib-credbridge".to_string())
        );

        config.bridge.transport = TransportKind::Tcp;
        assert_eq!(
            Endpoint::for_root(root, &config).unwrap(),
            Endpoint::Tcp("127.0.0.1:47365".parse().unwrap())
        );

        config.tcp.listen = "nope".to_string();
        assert!(Endpoint::for_root(root, &config).is_err());
    }

    #[tokio::test]
    async fn test_tcp_listener_rejects_disallowed_peer() {
        let endpoint = Endpoint::Tcp("127.0.0.1:0".parse().unwrap());
        let mut listener = BridgeListener::bind(&endpoint, vec![net("192.168.5.0/24")])
            .await
            .unwrap();
        let addr = match &listener {
            BridgeListener::Tcp { listener, .. } => listener.local_addr().unwrap(),
            #[allow(unreachable_patterns)]
            _ => unreachable!(),
        };

        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        assert!(listener.accept().await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_replaces_stale_socket_and_sets_modes() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let path = socket_path(tmp.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "").unwrap();

        let _listener = BridgeListener::bind(&Endpoint::Unix(path.clone()), vec![])
            .await
            .unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o750);
    }

    #[cfg(windows)]
    #[tokio::test]
    async fn test_pipe_bind_accept_and_refuse_second_owner() {
        let root = std::env::temp_dir().join(format!("credbridge-pipe-{}", std::process::id()));
        let endpoint = Endpoint::Pipe(pipe_name(&root));
        let mut listener = BridgeListener::bind(&endpoint, vec![]).await.unwrap();

        let err = BridgeListener::bind(&endpoint, vec![]).await.err().unwrap();
        assert!(matches!(err, BridgeError::EndpointInUse(_)));

        let accept = tokio::spawn(async move { listener.accept().await.map(|s| s.is_some()) });
        let _client = connect(&endpoint).await.unwrap();
        assert!(accept.await.unwrap().unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_refuses_live_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(socket_path(tmp.path()));
        let _first = BridgeListener::bind(&endpoint, vec![]).await.unwrap();
        assert!(is_live(&endpoint).await);
        let err = BridgeListener::bind(&endpoint, vec![]).await.err().unwrap();
        assert!(matches!(err, BridgeError::EndpointInUse(_)));
    }
}
