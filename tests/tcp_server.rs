mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use backend_core::error::TcpClientError;
use backend_core::events::{EventManagerSettings, LogEventManager, MemoryEventStore};
use backend_core::lifecycle::startup::{default_handlers, TCP_RECEIVE_EVENT};
use backend_core::net::{HandlerError, HandlerRegistry, Request, Status, TcpClient};
use backend_core::observability::Logged;
use backend_core::config::TcpConfig;
use common::{start_tcp_server, tcp_config, wait_until};

const TIMEOUT: Duration = Duration::from_secs(2);

fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn("PING", |_| async { Ok(b"PONG".to_vec()) })
        .register_fn("ECHO", |req: Request| async move { Ok(req.payload) })
        .register_fn("FAIL", |_| async { Err(HandlerError::from("rejected")) })
        .register_fn("SLOW", |req: Request| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(req.payload)
        });
    registry
}

#[tokio::test]
async fn test_request_response_in_order() {
    let server = start_tcp_server(tcp_config(), registry()).await;
    let mut client = TcpClient::connect(server.addr, TIMEOUT).await.unwrap();

    assert_eq!(client.request("PING", b"").await.unwrap().text(), "PONG");
    for i in 0..20 {
        let payload = format!("message {}", i);
        let response = client.request("ECHO", payload.as_bytes()).await.unwrap();
        assert!(response.is_ok());
        assert_eq!(response.text(), payload);
    }

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_command_and_handler_error_keep_connection() {
    let server = start_tcp_server(tcp_config(), registry()).await;
    let mut client = TcpClient::connect(server.addr, TIMEOUT).await.unwrap();

    let response = client.request("NOPE", b"").await.unwrap();
    assert_eq!(response.status, Status::UnknownCommand);

    let response = client.request("FAIL", b"").await.unwrap();
    assert_eq!(response.status, Status::HandlerError);
    assert_eq!(response.text(), "rejected");

    assert_eq!(client.request("PING", b"").await.unwrap().text(), "PONG");
    server.stop().await;
}

#[tokio::test]
async fn test_malformed_frame_closes_only_that_connection() {
    let server = start_tcp_server(tcp_config(), registry()).await;
    let mut healthy = TcpClient::connect(server.addr, TIMEOUT).await.unwrap();

    // Zero-length frame.
    let mut raw = TcpStream::connect(server.addr).await.unwrap();
    raw.write_all(&[0, 0, 0, 0]).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(TIMEOUT, raw.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0, "server should close the connection without a response");

    // Command length overruns the frame.
    let mut raw = TcpStream::connect(server.addr).await.unwrap();
    raw.write_all(&[0, 0, 0, 2, 9, b'P']).await.unwrap();
    let n = tokio::time::timeout(TIMEOUT, raw.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);

    // Length above max_frame_len.
    let mut raw = TcpStream::connect(server.addr).await.unwrap();
    raw.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
    let n = tokio::time::timeout(TIMEOUT, raw.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);

    assert_eq!(healthy.request("PING", b"").await.unwrap().text(), "PONG");
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_clients() {
    let server = start_tcp_server(tcp_config(), registry()).await;

    let mut tasks = Vec::new();
    for c in 0..10 {
        let addr = server.addr;
        tasks.push(tokio::spawn(async move {
            let mut client = TcpClient::connect(addr, TIMEOUT).await.unwrap();
            for i in 0..20 {
                let payload = format!("{}-{}", c, i);
                let response = client.request("ECHO", payload.as_bytes()).await.unwrap();
                assert_eq!(response.text(), payload);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    server.stop().await;
}

#[tokio::test]
async fn test_client_timeout_marks_connection_closed() {
    let config = tcp_config();
    let server = start_tcp_server(config, registry()).await;
    let mut client = TcpClient::connect(server.addr, Duration::from_millis(50)).await.unwrap();

    let err = client.request("SLOW", b"x").await.unwrap_err();
    assert!(matches!(err, TcpClientError::Timeout(_)));
    assert!(matches!(client.request("PING", b"").await, Err(TcpClientError::Closed)));
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_request() {
    let server = start_tcp_server(tcp_config(), registry()).await;
    let mut client = TcpClient::connect(server.addr, TIMEOUT).await.unwrap();

    let in_flight = tokio::spawn(async move { client.request("SLOW", b"last").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.shutdown.trigger();

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.text(), "last");

    tokio::time::timeout(Duration::from_secs(5), server.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // Listener is gone.
    assert!(TcpClient::connect(server.addr, Duration::from_millis(200)).await.is_err());
}

#[tokio::test]
async fn test_event_command_reaches_event_manager() {
    let store = Arc::new(MemoryEventStore::new());
    let events = Arc::new(Logged::new(
        "log_events",
        LogEventManager::new(store.clone(), EventManagerSettings::default()),
    ));
    let server = start_tcp_server(tcp_config(), default_handlers(events.clone())).await;
    let mut client = TcpClient::connect(server.addr, TIMEOUT).await.unwrap();

    let response = client.request("EVENT", br#"{"action":"login"}"#).await.unwrap();
    assert_eq!(response.text(), "ACCEPTED");
    assert_eq!(client.request("PING", b"").await.unwrap().text(), "PONG");

    events.flush().await.unwrap();
    let stored = store.all();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].event_type, TCP_RECEIVE_EVENT);
    assert_eq!(stored[0].payload["action"], "login");
    assert!(stored[0].source.is_some());

    server.stop().await;
}

#[tokio::test]
async fn test_stalled_peer_is_closed_after_idle_timeout() {
    let config = TcpConfig {
        idle_timeout_ms: 200,
        ..tcp_config()
    };
    let server = start_tcp_server(config, registry()).await;

    // Half a length prefix, then nothing.
    let mut stalled = TcpStream::connect(server.addr).await.unwrap();
    stalled.write_all(&[0, 0]).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(TIMEOUT, stalled.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0, "idle connection should be closed without a response");

    let peers = server.peers.clone();
    wait_until("stalled peer to be released", || peers.active_count() == 0).await;

    // Traffic keeps a connection alive past the idle window.
    let mut client = TcpClient::connect(server.addr, TIMEOUT).await.unwrap();
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.request("PING", b"").await.unwrap().text(), "PONG");
    }
    server.stop().await;
}

#[tokio::test]
async fn test_push_reaches_only_the_chosen_peer() {
    let server = start_tcp_server(tcp_config(), registry()).await;
    let mut target = TcpClient::connect(server.addr, TIMEOUT).await.unwrap();
    let mut bystander = TcpClient::connect(server.addr, TIMEOUT).await.unwrap();

    let peers = server.peers.clone();
    wait_until("both clients to register", || peers.peers().len() == 2).await;
    let listed: Vec<_> = server.peers.peers().into_iter().map(|p| p.peer).collect();
    assert!(listed.contains(&target.local_addr()));
    assert!(listed.contains(&bystander.local_addr()));

    server.peers.send_to(target.local_addr(), b"STOP LINE 3".to_vec()).unwrap();
    assert_eq!(target.recv_push().await.unwrap(), b"STOP LINE 3".to_vec());

    // Requests keep working on both connections after the push.
    assert_eq!(target.request("ECHO", b"after").await.unwrap().text(), "after");
    assert_eq!(bystander.request("PING", b"").await.unwrap().text(), "PONG");

    let gone = target.local_addr();
    target.close().await;
    wait_until("closed client to unregister", || peers.peers().iter().all(|p| p.peer != gone)).await;
    assert!(server.peers.send_to(gone, b"late".to_vec()).is_err());

    server.stop().await;
}

#[tokio::test]
async fn test_disconnect_hook_sees_every_closed_peer() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut handlers = registry();
    handlers.on_disconnect(move |info| {
        let _ = tx.send(info.peer);
    });
    let server = start_tcp_server(tcp_config(), handlers).await;

    let client = TcpClient::connect(server.addr, TIMEOUT).await.unwrap();
    let addr = client.local_addr();
    client.close().await;

    let seen = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(seen, addr);
    server.stop().await;
}
