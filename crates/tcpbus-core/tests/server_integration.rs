//! Integration tests for the TCP connection registry.
//!
//! These tests run a real `TcpServer` on a loopback port and drive it with
//! plain tokio streams, checking registration, dispatch, reaping, partial
//! broadcast failure and shutdown.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tcpbus_core::connection::ConnectionState;
use tcpbus_core::{
    Connection, ErrorKind, Observer, ServerConfig, ServerError, TcpClient, TcpServer,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for an observer callback
const EVENT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Time after which "nothing arrived" is accepted as nothing will arrive
const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// Reaper interval used by reaping tests
const REAP_INTERVAL_MS: u64 = 50;

const LOOPBACK: &str = "127.0.0.1";

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Message { address: String, payload: Vec<u8> },
    Disconnect { address: String, reason: String },
}

/// Builds an observer that forwards every callback into a channel.
fn channel_observer(filter: &str) -> (Observer, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let disc_tx = tx.clone();

    let observer = Observer::for_address(filter)
        .on_message(move |address, payload| {
            let _ = tx.send(Seen::Message {
                address: address.to_string(),
                payload: payload.to_vec(),
            });
        })
        .on_disconnect(move |address, reason| {
            let _ = disc_tx.send(Seen::Disconnect {
                address: address.to_string(),
                reason: reason.to_string(),
            });
        });

    (observer, rx)
}

async fn next_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    timeout(EVENT_WAIT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for observer event")
        .expect("observer channel closed")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Seen>) {
    if let Ok(Some(seen)) = timeout(QUIET_PERIOD, rx.recv()).await {
        panic!("Expected no event, got {seen:?}");
    }
}

/// Test server context bound to an ephemeral loopback port.
struct TestServer {
    server: Arc<TcpServer>,
    addr: SocketAddr,
}

impl TestServer {
    async fn spawn(backlog: u32, auto_reap: bool) -> Self {
        let config = ServerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            reap_interval_ms: REAP_INTERVAL_MS,
            ..ServerConfig::default()
        };
        let server = Arc::new(TcpServer::new(config));
        server.start(0, backlog, auto_reap).await.expect("start server");
        let addr = server.local_addr().expect("server bound");
        Self { server, addr }
    }

    /// Connects a raw client and accepts it on the server side.
    async fn connect(&self) -> (TcpStream, Arc<Connection>) {
        let (client, accepted) = tokio::join!(
            TcpStream::connect(self.addr),
            self.server.accept_connection(2)
        );
        (client.expect("connect"), accepted.expect("accept"))
    }

    async fn shutdown(self) {
        self.server.shutdown().await.expect("shutdown");
    }
}

/// Reads exactly `len` bytes from a raw client.
async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(EVENT_WAIT_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("timed out reading")
        .expect("read");
    buf
}

// ============================================================================
// Accept / Registration
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_accepts_are_all_registered() {
    const N: usize = 8;
    let server = TestServer::spawn(16, false).await;

    let mut accepts = JoinSet::new();
    for _ in 0..N {
        let srv = Arc::clone(&server.server);
        accepts.spawn(async move { srv.accept_connection(5).await });
    }

    let mut clients = Vec::new();
    for _ in 0..N {
        clients.push(TcpStream::connect(server.addr).await.unwrap());
    }

    let mut accepted = 0;
    while let Some(result) = accepts.join_next().await {
        result.unwrap().expect("accept");
        accepted += 1;
    }

    assert_eq!(accepted, N);
    assert_eq!(server.server.live_count(), N);
    assert_eq!(server.server.connection_count().await, N);

    let client_addrs: HashSet<SocketAddr> =
        clients.iter().map(|c| c.local_addr().unwrap()).collect();
    let registered: HashSet<SocketAddr> = server
        .server
        .connections()
        .await
        .into_iter()
        .map(|info| info.peer)
        .collect();
    assert_eq!(registered, client_addrs);

    server.shutdown().await;
}

#[tokio::test]
async fn test_accepted_connection_is_listening() {
    let server = TestServer::spawn(5, false).await;
    let (client, conn) = server.connect().await;

    assert_eq!(conn.state(), ConnectionState::Listening);
    assert_eq!(conn.address(), LOOPBACK);
    assert_eq!(conn.peer(), client.local_addr().unwrap());

    let infos = server.server.connections().await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].address, LOOPBACK);

    server.shutdown().await;
}

// ============================================================================
// Message Dispatch
// ============================================================================

#[tokio::test]
async fn test_round_trip_payload_is_byte_identical() {
    let server = TestServer::spawn(5, false).await;
    let (observer, mut rx) = channel_observer(LOOPBACK);
    server.server.subscribe(observer);

    let (mut client, _conn) = server.connect().await;
    let sent: Vec<u8> = (0u8..=255).rev().collect();
    client.write_all(&sent).await.unwrap();

    // Transport may split the write; concatenate what arrives
    let mut received = Vec::new();
    while received.len() < sent.len() {
        match next_seen(&mut rx).await {
            Seen::Message { address, payload } => {
                assert_eq!(address, LOOPBACK);
                received.extend_from_slice(&payload);
            }
            other => panic!("Expected message, got {other:?}"),
        }
    }
    assert_eq!(received, sent);

    server.shutdown().await;
}

#[tokio::test]
async fn test_filtered_observer_ignores_other_addresses() {
    let server = TestServer::spawn(5, false).await;
    let (catch_all, mut all_rx) = channel_observer("");
    let (other, mut other_rx) = channel_observer("10.20.30.40");
    server.server.subscribe(catch_all);
    server.server.subscribe(other);

    let (mut client, _conn) = server.connect().await;
    client.write_all(b"ping").await.unwrap();

    assert_eq!(
        next_seen(&mut all_rx).await,
        Seen::Message {
            address: LOOPBACK.to_string(),
            payload: b"ping".to_vec()
        }
    );
    assert_quiet(&mut other_rx).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_after_connection_is_active() {
    let server = TestServer::spawn(5, false).await;
    let (mut client, _conn) = server.connect().await;

    let (observer, mut rx) = channel_observer("");
    server.server.subscribe(observer);

    client.write_all(b"late").await.unwrap();
    assert!(matches!(next_seen(&mut rx).await, Seen::Message { payload, .. } if payload == b"late"));

    server.shutdown().await;
}

// ============================================================================
// Disconnection / Reaping
// ============================================================================

#[tokio::test]
async fn test_peer_close_is_reaped_and_reported_to_exact_filter_only() {
    let server = TestServer::spawn(5, true).await;
    let (exact, mut exact_rx) = channel_observer(LOOPBACK);
    let (catch_all, mut all_rx) = channel_observer("");
    server.server.subscribe(exact);
    server.server.subscribe(catch_all);

    let (client, conn) = server.connect().await;
    assert_eq!(server.server.live_count(), 1);
    drop(client);

    match next_seen(&mut exact_rx).await {
        Seen::Disconnect { address, .. } => assert_eq!(address, LOOPBACK),
        other => panic!("Expected disconnect, got {other:?}"),
    }
    assert!(!conn.is_connected());
    assert_eq!(server.server.live_count(), 0);

    // Within a few reaper intervals the registry no longer holds it
    let deadline = tokio::time::Instant::now() + EVENT_WAIT_TIMEOUT;
    while server.server.connection_count().await > 0 {
        assert!(tokio::time::Instant::now() < deadline, "dead connection not reaped");
        sleep(Duration::from_millis(REAP_INTERVAL_MS)).await;
    }

    assert_quiet(&mut all_rx).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_without_reaper_dead_connection_stays_until_manual_reap() {
    let server = TestServer::spawn(5, false).await;
    let (observer, mut rx) = channel_observer(LOOPBACK);
    server.server.subscribe(observer);

    let (client, _conn) = server.connect().await;
    drop(client);
    assert!(matches!(next_seen(&mut rx).await, Seen::Disconnect { .. }));

    assert_eq!(server.server.live_count(), 0);
    assert_eq!(server.server.connection_count().await, 1);
    assert_eq!(server.server.reap().await, 1);
    assert_eq!(server.server.connection_count().await, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_connection_close_is_idempotent() {
    let server = TestServer::spawn(5, false).await;
    let (_client, conn) = server.connect().await;

    conn.close().await.unwrap();
    conn.close().await.unwrap();
    assert!(!conn.is_connected());
    assert_eq!(server.server.live_count(), 0);

    server.shutdown().await;
}

// ============================================================================
// Send / Broadcast
// ============================================================================

#[tokio::test]
async fn test_broadcast_stops_at_first_failure() {
    let server = TestServer::spawn(5, false).await;
    let (mut first, _c1) = server.connect().await;
    let (_second, c2) = server.connect().await;
    let (mut third, _c3) = server.connect().await;

    // Closed server-side, but still registered since there is no reaper
    c2.close().await.unwrap();

    let err = server.server.broadcast(b"msg").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Send);
    assert!(matches!(err, ServerError::Send { ref address, .. } if address == LOOPBACK));

    assert_eq!(read_exact(&mut first, 3).await, b"msg");

    let mut buf = [0u8; 3];
    assert!(
        timeout(QUIET_PERIOD, third.read(&mut buf)).await.is_err(),
        "connection after the failure must not be attempted"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_send_to_unknown_address_mutates_nothing() {
    let server = TestServer::spawn(5, false).await;
    let (_client, _conn) = server.connect().await;

    let err = server.server.send_to("192.0.2.1", b"x").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lookup);
    assert_eq!(server.server.connection_count().await, 1);
    assert_eq!(server.server.live_count(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_send_to_duplicate_address_picks_first_registered() {
    let server = TestServer::spawn(5, false).await;
    let (mut first, _c1) = server.connect().await;
    let (mut second, _c2) = server.connect().await;

    server.server.send_to(LOOPBACK, b"only-first").await.unwrap();

    assert_eq!(read_exact(&mut first, 10).await, b"only-first");
    let mut buf = [0u8; 1];
    assert!(timeout(QUIET_PERIOD, second.read(&mut buf)).await.is_err());

    server.shutdown().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_broadcast_hello_then_shutdown() {
    let server = TestServer::spawn(5, true).await;

    let mut clients = Vec::new();
    let mut receivers = Vec::new();
    let mut connections = Vec::new();
    for _ in 0..3 {
        let client = TcpClient::default();
        let (observer, rx) = channel_observer("");
        client.subscribe(observer);
        let (connected, accepted) = tokio::join!(
            client.connect_to(LOOPBACK, server.addr.port()),
            server.server.accept_connection(2)
        );
        connected.unwrap();
        connections.push(accepted.unwrap());
        clients.push(client);
        receivers.push(rx);
    }

    server.server.broadcast(b"hello").await.unwrap();

    for rx in &mut receivers {
        assert_eq!(
            next_seen(rx).await,
            Seen::Message {
                address: LOOPBACK.to_string(),
                payload: b"hello".to_vec()
            }
        );
    }

    server.server.shutdown().await.unwrap();

    for conn in &connections {
        assert!(!conn.is_connected());
    }
    assert_eq!(server.server.connection_count().await, 0);
    assert_eq!(server.server.live_count(), 0);

    let err = server.server.accept_connection(1).await.unwrap_err();
    assert!(matches!(err, ServerError::ListenerClosed));
    assert_eq!(err.kind(), ErrorKind::Setup);

    // Listener socket is gone
    assert!(TcpStream::connect(server.addr).await.is_err());

    for client in &clients {
        client.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_shutdown_wakes_pending_accept() {
    let server = TestServer::spawn(5, false).await;

    let srv = Arc::clone(&server.server);
    let pending = tokio::spawn(async move { srv.accept_connection(0).await });
    sleep(Duration::from_millis(50)).await;

    server.server.shutdown().await.unwrap();

    let result = timeout(EVENT_WAIT_TIMEOUT, pending)
        .await
        .expect("pending accept not woken")
        .unwrap();
    assert!(matches!(result, Err(ServerError::ListenerClosed)));
}

#[tokio::test]
async fn test_server_can_restart_after_shutdown() {
    let server = TestServer::spawn(5, true).await;
    server.server.shutdown().await.unwrap();

    server.server.start(0, 5, true).await.unwrap();
    let addr = server.server.local_addr().unwrap();
    let (client, accepted) = tokio::join!(
        TcpStream::connect(addr),
        server.server.accept_connection(2)
    );
    client.unwrap();
    accepted.unwrap();
    assert_eq!(server.server.live_count(), 1);

    server.shutdown().await;
}
