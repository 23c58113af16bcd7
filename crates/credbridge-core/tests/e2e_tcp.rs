//! Bridge over the loopback TCP transport, backed by an in-memory store.

use credbridge_config::{BridgeConfig, TransportKind};
use credbridge_core::test_support::{MemoryBackend, MemoryCall};
use credbridge_core::{
    address_file, BridgeClient, BridgeState, CredentialBridge, CredentialRecord, Endpoint,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn start_tcp_bridge(
    allowed_networks: &[&str],
) -> (CredentialBridge, Arc<MemoryBackend>, BridgeClient) {
    let mut config = BridgeConfig::default();
    config.tcp.allowed_networks = allowed_networks.iter().map(|n| n.to_string()).collect();
    start_with_config(config).await
}

async fn start_with_config(
    config: BridgeConfig,
) -> (CredentialBridge, Arc<MemoryBackend>, BridgeClient) {
    let backend = Arc::new(MemoryBackend::new());
    let bridge = CredentialBridge::new(config, backend.clone());
    bridge
        .start_at(Endpoint::Tcp("127.0.0.1:0".parse().unwrap()))
        .await
        .unwrap();

    let endpoint = bridge.endpoint().await.unwrap();
    let client = BridgeClient::new(endpoint).with_timeout(Duration::from_secs(5));
    (bridge, backend, client)
}

#[tokio::test]
async fn test_roundtrip_over_tcp() {
    let (bridge, backend, client) = start_tcp_bridge(&["127.0.0.0/8"]).await;

    client
        .store(&CredentialRecord::new("docker.io", "alice", "hunter2"))
        .await
        .unwrap();

    // Every Docker Hub spelling maps to the same key
    for alias in ["docker.io", "index.docker.io/v1/", "https://index.docker.io/v1/"] {
        let record = client.get(alias).await.unwrap().unwrap();
        assert_eq!(record.username, "alice");
        assert_eq!(record.server_url, "https://index.docker.io/v1/");
    }
    assert_eq!(
        backend.get_calls()[0],
        MemoryCall::Store {
            server_url: "https://index.docker.io/v1/".to_string()
        }
    );

    bridge.stop().await;
    assert_eq!(bridge.state(), BridgeState::Stopped);
}

#[tokio::test]
async fn test_peer_outside_allow_list_is_dropped() {
    let (bridge, backend, client) = start_tcp_bridge(&["192.168.5.0/24"]).await;

    let result = client.get("localhost:5000").await;
    assert!(!matches!(result, Ok(Some(_))));
    assert!(backend.get_calls().is_empty());

    bridge.stop().await;
}

#[tokio::test]
async fn test_slow_backend_does_not_block_other_connections() {
    let (bridge, backend, client) = start_tcp_bridge(&["127.0.0.0/8"]).await;
    backend.insert(CredentialRecord::new("localhost:5000", "u", "s"));
    backend.set_latency(Duration::from_millis(300));

    let started = std::time::Instant::now();
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.get("localhost:5000").await.unwrap() })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().is_some());
    }
    // Served concurrently, not one after another
    assert!(started.elapsed() < Duration::from_millis(300 * 8));

    bridge.stop().await;
}

#[tokio::test]
async fn test_stop_lets_in_flight_request_finish() {
    let (bridge, backend, client) = start_tcp_bridge(&["127.0.0.0/8"]).await;
    backend.insert(CredentialRecord::new("localhost:5000", "u", "s"));
    backend.set_latency(Duration::from_millis(300));

    let in_flight = tokio::spawn({
        let client = client.clone();
        async move { client.get("localhost:5000").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    bridge.stop().await;

    let record = in_flight.await.unwrap().unwrap();
    assert!(record.is_some());
}

fn tcp_addr(client: &BridgeClient) -> std::net::SocketAddr {
    match client.endpoint() {
        Endpoint::Tcp(addr) => *addr,
        other => panic!("not a tcp endpoint: {}", other),
    }
}

#[tokio::test]
async fn test_oversized_requests_get_error_reply() {
    let (bridge, _backend, client) = start_tcp_bridge(&["127.0.0.0/8"]).await;
    let addr = tcp_addr(&client);

    for _ in 0..10 {
        let mut request = b"get\n".to_vec();
        request.extend(std::iter::repeat(b'a').take(8192));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&request).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        let reply = String::from_utf8(reply).unwrap();
        assert!(reply.starts_with("error: "), "reply: {:?}", reply);
        assert!(reply.contains("4096"));
    }

    bridge.stop().await;
}

#[tokio::test]
async fn test_silent_client_is_dropped_after_read_timeout() {
    let mut config = BridgeConfig::default();
    config.bridge.read_timeout_secs = 1;
    config.tcp.allowed_networks = vec!["127.0.0.0/8".to_string()];
    let (bridge, backend, client) = start_with_config(config).await;
    backend.insert(CredentialRecord::new("localhost:5000", "u", "s"));

    // Connect and never send anything
    let mut silent = TcpStream::connect(tcp_addr(&client)).await.unwrap();
    let started = std::time::Instant::now();
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), silent.read_to_end(&mut reply))
        .await
        .expect("bridge should close the idle connection")
        .unwrap();
    assert!(reply.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(900));

    // The listener is still serving
    assert!(client.get("localhost:5000").await.unwrap().is_some());

    bridge.stop().await;
}

#[tokio::test]
async fn test_windows_host_client_finds_published_address() {
    let root = tempfile::tempdir().unwrap();
    let mut config = BridgeConfig::default();
    config.bridge.transport = TransportKind::Tcp;
    config.tcp.listen = "127.0.0.1:0".to_string();
    config.tcp.allowed_networks = vec!["127.0.0.0/8".to_string()];

    let backend = Arc::new(MemoryBackend::new());
    backend.insert(CredentialRecord::new("localhost:5000", "u", "s"));
    let bridge = CredentialBridge::new(config, backend);
    bridge.start(root.path()).await.unwrap();

    let endpoint = BridgeClient::endpoint_for(root.path().to_str().unwrap(), "windows");
    assert_eq!(Some(endpoint.clone()), bridge.endpoint().await);

    let client = BridgeClient::new(endpoint).with_timeout(Duration::from_secs(5));
    assert!(client.get("localhost:5000").await.unwrap().is_some());

    bridge.stop().await;
    assert!(!address_file(root.path()).exists());
}
