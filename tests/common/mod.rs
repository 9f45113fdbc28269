//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use backend_core::config::TcpConfig;
use backend_core::lifecycle::Shutdown;
use backend_core::net::connection::ConnectionTracker;
use backend_core::net::listener::ListenerError;
use backend_core::net::{HandlerRegistry, TcpServer};

/// Start a programmable mock HTTP backend on an ephemeral port.
///
/// `f` receives the 1-based request number and returns status and body.
pub async fn start_programmable_backend<F, Fut>(f: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let f = Arc::new(f);

    let counter = hits.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = f.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                if read_http_request(&mut socket).await.is_none() {
                    return;
                }
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let (status, body) = f(n).await;
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    reason(status),
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, hits)
}

/// Backend answering with `statuses` in order, then 200.
pub async fn start_scripted_backend(statuses: Vec<u16>) -> (SocketAddr, Arc<AtomicUsize>) {
    let statuses = Arc::new(statuses);
    start_programmable_backend(move |n| {
        let statuses = statuses.clone();
        async move {
            let status = statuses.get(n - 1).copied().unwrap_or(200);
            (status, format!("response {}", n))
        }
    })
    .await
}

/// Read one request (headers plus Content-Length body). `None` on EOF.
async fn read_http_request(socket: &mut TcpStream) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let content_length = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some(buf)
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        408 => "Request Timeout",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn tcp_config() -> TcpConfig {
    TcpConfig {
        bind_address: "127.0.0.1:0".to_string(),
        max_frame_len: 64 * 1024,
        request_timeout_ms: 2_000,
        shutdown_grace_ms: 2_000,
        ..TcpConfig::default()
    }
}

/// Poll `check` every 10ms until it holds, failing after five seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub peers: ConnectionTracker,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<Result<(), ListenerError>>,
}

impl TestServer {
    /// Trigger shutdown and wait for the server to drain.
    pub async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server should stop")
            .unwrap()
            .unwrap();
    }
}

pub async fn start_tcp_server(config: TcpConfig, registry: HandlerRegistry) -> TestServer {
    let server = TcpServer::bind(&config, registry).await.unwrap();
    let addr = server.local_addr().unwrap();
    let peers = server.tracker();
    let shutdown = Shutdown::new();
    let handle = tokio::spawn(server.run(shutdown.subscribe()));
    TestServer {
        addr,
        peers,
        shutdown,
        handle,
    }
}
