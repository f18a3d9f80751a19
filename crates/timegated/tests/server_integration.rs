//! Integration tests for the Unix socket server.
//!
//! These tests verify the DaemonServer works correctly as a complete system,
//! testing connection handling, protocol negotiation, subscriptions, and
//! graceful shutdown.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed. We test
//! the panic-free behavior of production code through assertions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use timegate_core::{HOUR_MS, MINUTE_MS};
use timegate_protocol::{Action, ClientRequest, DaemonReply, Directive, ProtocolVersion};
use timegated::engine::spawn_engine;
use timegated::server::DaemonServer;
use timegated::storage::Storage;
use timegated::store::MemoryStore;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for server socket to appear
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between socket existence checks
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period for server shutdown
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

// ============================================================================
// Test Helpers
// ============================================================================

/// Test server context that manages server lifecycle and cleanup.
struct TestServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    _temp_dir: TempDir, // Keep alive for RAII cleanup
}

impl TestServer {
    /// Spawns a new test server in the background.
    async fn spawn() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("test.sock");

        let storage = Storage::new(Arc::new(MemoryStore::new()));
        let (engine, _engine_task) = spawn_engine(storage).await.expect("spawn engine");
        let cancel_token = CancellationToken::new();

        let server = DaemonServer::new(socket_path.clone(), engine, cancel_token.clone());

        // Spawn server in background
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        // Wait for socket to be ready with timeout
        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT {
            if socket_path.exists() {
                break;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }

        // Fail fast if socket didn't appear
        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        TestServer {
            socket_path,
            cancel_token,
            _temp_dir: temp_dir,
        }
    }

    /// Creates a client connection to the server.
    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }

    /// Shuts down the server gracefully.
    async fn shutdown(self) {
        self.cancel_token.cancel();
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

/// Test client connection with protocol helpers.
struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Sends a request to the server.
    async fn send(&mut self, request: ClientRequest) {
        let json = serde_json::to_string(&request).unwrap();
        self.writer.write_all(json.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Receives a reply from the server.
    async fn recv(&mut self) -> DaemonReply {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Performs handshake with optional client ID.
    async fn handshake(&mut self, client_id: Option<String>) -> String {
        self.send(ClientRequest::connect(client_id)).await;

        match self.recv().await {
            DaemonReply::Connected { client_id, .. } => client_id,
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    /// Performs handshake with a specific protocol version.
    async fn handshake_with_version(&mut self, version: ProtocolVersion) -> DaemonReply {
        let request = ClientRequest {
            protocol_version: version,
            action: Action::Connect { client_id: None },
        };
        self.send(request).await;
        self.recv().await
    }
}

// ============================================================================
// Connection Tests
// ============================================================================

#[tokio::test]
async fn test_server_accepts_connection() {
    let server = TestServer::spawn().await;

    // Should be able to connect
    let _client = server.connect().await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_success() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    // Send connect with client ID
    client
        .send(ClientRequest::connect(Some("test-client".to_string())))
        .await;

    // Should receive Connected
    match client.recv().await {
        DaemonReply::Connected {
            protocol_version,
            client_id,
        } => {
            assert_eq!(protocol_version, ProtocolVersion::CURRENT);
            assert_eq!(client_id, "test-client");
        }
        other => panic!("Expected Connected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_auto_assigns_client_id() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    // Send connect without client_id
    client.send(ClientRequest::connect(None)).await;

    // Should receive Connected with auto-assigned ID
    match client.recv().await {
        DaemonReply::Connected { client_id, .. } => {
            assert!(
                client_id.starts_with("client-"),
                "Expected auto-assigned ID starting with 'client-', got: {client_id}"
            );
        }
        other => panic!("Expected Connected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_version_mismatch() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    // Send connect with incompatible version (major version 99)
    let response = client
        .handshake_with_version(ProtocolVersion::new(99, 0))
        .await;

    // Should receive Rejected
    match response {
        DaemonReply::Rejected { reason, .. } => {
            assert!(
                reason.contains("not compatible"),
                "Expected 'not compatible' in reason, got: {reason}"
            );
        }
        other => panic!("Expected Rejected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_ping_pong() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    client.send(ClientRequest::ping(42)).await;

    match client.recv().await {
        DaemonReply::Pong { seq } => assert_eq!(seq, 42),
        other => panic!("Expected Pong, got {other:?}"),
    }

    server.shutdown().await;
}

// ============================================================================
// Domain Operations Over the Wire
// ============================================================================

#[tokio::test]
async fn test_add_and_list_domains() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    client
        .send(ClientRequest::new(Action::AddDomain {
            domain: "example.com".to_string(),
            daily_limit: Some(HOUR_MS),
            weekly_limit: Some(10 * HOUR_MS),
        }))
        .await;

    match client.recv().await {
        DaemonReply::DomainRecord { domain, record } => {
            assert_eq!(domain, "example.com");
            assert_eq!(record.daily_limit, Some(HOUR_MS));
        }
        other => panic!("Expected DomainRecord, got {other:?}"),
    }

    client.send(ClientRequest::new(Action::GetAllDomains)).await;

    match client.recv().await {
        DaemonReply::DomainList { domains } => {
            assert!(domains.contains_key("example.com"));
        }
        other => panic!("Expected DomainList, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_domain_gets_structured_error() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    let add = ClientRequest::new(Action::AddDomain {
        domain: "example.com".to_string(),
        daily_limit: None,
        weekly_limit: None,
    });
    client.send(add.clone()).await;
    let _ = client.recv().await;

    client.send(add).await;
    match client.recv().await {
        DaemonReply::Error { code, .. } => {
            assert_eq!(code, Some(timegate_protocol::ErrorCode::DomainExists));
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_check_block_status_untracked() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    client
        .send(ClientRequest::new(Action::CheckBlockStatus {
            domain: "nobody.example".to_string(),
        }))
        .await;

    match client.recv().await {
        DaemonReply::BlockStatus { decision, record } => {
            assert!(!decision.is_blocked());
            assert!(record.is_none());
        }
        other => panic!("Expected BlockStatus, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_request_keeps_connection_alive() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    // Garbage line gets an error reply, not a disconnect
    client.writer.write_all(b"{not json}\n").await.unwrap();
    client.writer.flush().await.unwrap();

    match client.recv().await {
        DaemonReply::Error { .. } => {}
        other => panic!("Expected Error, got {other:?}"),
    }

    // Connection still works
    client.send(ClientRequest::ping(1)).await;
    match client.recv().await {
        DaemonReply::Pong { seq } => assert_eq!(seq, 1),
        other => panic!("Expected Pong, got {other:?}"),
    }

    server.shutdown().await;
}

// ============================================================================
// Subscription and Directive Delivery
// ============================================================================

#[tokio::test]
async fn test_subscriber_receives_extension_notification() {
    let server = TestServer::spawn().await;

    // One subscribed integration, one control client
    let mut subscriber = server.connect().await;
    subscriber.handshake(Some("integration".to_string())).await;
    subscriber.send(ClientRequest::new(Action::Subscribe)).await;
    match subscriber.recv().await {
        DaemonReply::Subscribed => {}
        other => panic!("Expected Subscribed, got {other:?}"),
    }

    let mut control = server.connect().await;
    control.handshake(Some("cli".to_string())).await;
    control
        .send(ClientRequest::new(Action::RequestExtension {
            domain: "example.com".to_string(),
            duration: Some(30 * MINUTE_MS),
            reason: None,
        }))
        .await;
    match control.recv().await {
        DaemonReply::ExtensionGranted {
            remaining_extensions,
            ..
        } => assert_eq!(remaining_extensions, 2),
        other => panic!("Expected ExtensionGranted, got {other:?}"),
    }

    // The grant's notification is pushed to the subscriber
    match subscriber.recv().await {
        DaemonReply::Directive {
            directive: Directive::Notify { id, .. },
        } => {
            assert_eq!(id, "extension-example.com");
        }
        other => panic!("Expected Notify directive, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_requires_prior_connect() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    // Subscribe without handshake fails the handshake and closes
    client.send(ClientRequest::new(Action::Subscribe)).await;
    match client.recv().await {
        DaemonReply::Error { message, .. } => {
            assert!(message.contains("connect"));
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_action_closes_cleanly() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.handshake(None).await;

    client.send(ClientRequest::new(Action::Disconnect)).await;

    // Server closes the connection: read returns EOF
    let mut line = String::new();
    let n = client.reader.read_line(&mut line).await.unwrap();
    assert_eq!(n, 0);

    server.shutdown().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_removes_socket_file() {
    let server = TestServer::spawn().await;
    let socket_path = server.socket_path.clone();
    assert!(socket_path.exists());

    server.shutdown().await;
    assert!(!socket_path.exists());
}
