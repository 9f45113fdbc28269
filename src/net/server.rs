//! Framed TCP request/response server.
//!
//! # Responsibilities
//! - Accept connections (bounded by the listener's semaphore)
//! - Serve each connection in its own task, one request at a time, in order
//! - Route each request to the handler registered for its command
//! - Push server-initiated frames to a chosen peer between responses
//! - Drain connections on shutdown, bounded by `shutdown_grace`
//!
//! # Design Decisions
//! - The handler registry is frozen before serving and shared read-only
//! - Handlers run in their own task: a panic becomes a `HandlerError` frame
//! - Malformed frames and idle peers close only their own connection
//! - On shutdown a connection finishes its current request, then closes

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::config::TcpConfig;
use crate::error::ProtocolError;
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::net::codec::{read_frame, write_frame, RequestFrame, ResponseFrame, Status};
use crate::net::connection::{ConnectionGuard, ConnectionId, ConnectionTracker, PeerInfo};
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::observability::{metrics, Logged};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Called once per connection after it closed, whatever the reason.
pub type DisconnectHook = Arc<dyn Fn(&PeerInfo) + Send + Sync>;

/// A decoded request as seen by handlers.
#[derive(Debug, Clone)]
pub struct Request {
    pub command: String,
    pub payload: Vec<u8>,
    pub peer: SocketAddr,
    pub connection_id: ConnectionId,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request) -> Result<Vec<u8>, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send,
{
    async fn handle(&self, request: Request) -> Result<Vec<u8>, HandlerError> {
        (self.0)(request).await
    }
}

/// Why a handler produced no payload. The display text is sent to the client.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    Handler(String),

    #[error("internal handler error")]
    Panicked,

    #[error("handler timed out")]
    TimedOut,
}

/// Command name → handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
    on_disconnect: Option<DisconnectHook>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `command`, replacing any previous one.
    pub fn register(&mut self, command: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.insert(command.into(), handler);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, command: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
    {
        self.register(command, Arc::new(FnHandler(f)))
    }

    /// Run `hook` whenever a connection closes.
    pub fn on_disconnect<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&PeerInfo) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }

    pub fn get(&self, command: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(command).cloned()
    }

    pub fn commands(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run `handler` in its own task, bounded by `timeout`.
    async fn invoke(&self, handler: Arc<dyn Handler>, request: Request, timeout: Duration) -> Result<Vec<u8>, DispatchError> {
        let mut task = tokio::spawn(async move { handler.handle(request).await });
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result.map_err(|e| DispatchError::Handler(e.to_string())),
            Ok(Err(_)) => Err(DispatchError::Panicked),
            Err(_) => {
                task.abort();
                Err(DispatchError::TimedOut)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ConnectionSettings {
    max_frame_len: usize,
    request_timeout: Duration,
    idle_timeout: Duration,
}

pub struct TcpServer {
    listener: Listener,
    registry: Arc<Logged<HandlerRegistry>>,
    settings: ConnectionSettings,
    shutdown_grace: Duration,
    tracker: ConnectionTracker,
}

impl TcpServer {
    pub async fn bind(config: &TcpConfig, registry: HandlerRegistry) -> Result<Self, ListenerError> {
        let listener = Listener::bind(config).await?;
        tracing::info!(commands = ?registry.commands(), "TCP handlers registered");
        Ok(Self {
            listener,
            registry: Arc::new(Logged::new("tcp_server", registry)),
            settings: ConnectionSettings {
                max_frame_len: config.max_frame_len,
                request_timeout: config.request_timeout(),
                idle_timeout: config.idle_timeout(),
            },
            shutdown_grace: config.shutdown_grace(),
            tracker: ConnectionTracker::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle on the connection table that outlives [`run`](Self::run).
    /// Lists peers and pushes frames to them while the server runs.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Serve until `shutdown` fires, then drain.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<(), ListenerError> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let (guard, outbound) = self.tracker.track(peer);
                        let registry = Arc::clone(&self.registry);
                        let settings = self.settings;
                        let signal = shutdown.clone();
                        connections.spawn(serve_connection(stream, guard, outbound, permit, registry, settings, signal));
                    }
                    Err(ListenerError::Accept(e)) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                    Err(e) => return Err(e),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Connection task failed");
                    }
                }
            }
        }

        // Stop accepting before draining.
        drop(self.listener);
        let remaining = self.tracker.active_count();
        tracing::info!(connections = remaining, grace = ?self.shutdown_grace, "TCP server draining");

        match tokio::time::timeout(self.shutdown_grace, self.tracker.wait_idle()).await {
            Ok(()) => {
                while let Some(joined) = connections.join_next().await {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Connection task failed");
                    }
                }
            }
            Err(_) => {
                tracing::warn!(
                    connections = self.tracker.active_count(),
                    "Grace period elapsed, closing remaining connections"
                );
                connections.shutdown().await;
            }
        }
        tracing::info!("TCP server stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    guard: ConnectionGuard,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    _permit: ConnectionPermit,
    registry: Arc<Logged<HandlerRegistry>>,
    settings: ConnectionSettings,
    mut shutdown: ShutdownSignal,
) {
    let id = guard.id();
    let peer = guard.info().peer;
    tracing::debug!(connection_id = %id, peer_addr = %peer, "Connection opened");
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(connection_id = %id, error = %e, "Failed to set TCP_NODELAY");
    }
    let (reader, mut writer) = stream.into_split();

    // The read future survives pushes; dropping it mid-frame would desync the stream.
    let mut pending = Box::pin(next_frame(reader, settings.max_frame_len));
    let idle = tokio::time::sleep(settings.idle_timeout);
    tokio::pin!(idle);

    loop {
        let (reader, frame) = tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(connection_id = %id, "Closing connection for shutdown");
                break;
            }
            _ = &mut idle => {
                tracing::info!(connection_id = %id, peer_addr = %peer, idle = ?settings.idle_timeout, "Idle connection closed");
                break;
            }
            Some(payload) = outbound.recv() => {
                if !send(&mut writer, ResponseFrame::push(payload), id).await {
                    break;
                }
                continue;
            }
            read = &mut pending => read,
        };

        let request = match frame.and_then(|body| body.map(|b| RequestFrame::decode(&b)).transpose()) {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::debug!(connection_id = %id, "Peer closed connection");
                break;
            }
            Err(e) => {
                tracing::warn!(connection_id = %id, peer_addr = %peer, error = %e, "Protocol error, closing connection");
                break;
            }
        };

        let response = dispatch(&registry, request, peer, id, settings.request_timeout).await;
        if !send(&mut writer, response, id).await {
            break;
        }
        if let Some(deadline) = tokio::time::Instant::now().checked_add(settings.idle_timeout) {
            idle.as_mut().reset(deadline);
        }
        pending.set(next_frame(reader, settings.max_frame_len));
    }

    if let Some(hook) = &registry.on_disconnect {
        hook(guard.info());
    }
    tracing::info!(connection_id = %id, peer_addr = %peer, "Client disconnected");
}

/// Read the next frame body, handing the read half back with it.
async fn next_frame(mut reader: OwnedReadHalf, max_frame_len: usize) -> (OwnedReadHalf, Result<Option<Vec<u8>>, ProtocolError>) {
    let frame = read_frame(&mut reader, max_frame_len).await;
    (reader, frame)
}

/// Write one frame. `false` means the connection should close.
async fn send(writer: &mut OwnedWriteHalf, frame: ResponseFrame, id: ConnectionId) -> bool {
    let bytes = match frame.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(connection_id = %id, error = %e, "Failed to encode frame");
            return false;
        }
    };
    match write_frame(writer, &bytes).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(connection_id = %id, error = %e, "Write failed, closing connection");
            false
        }
    }
}

async fn dispatch(
    registry: &Logged<HandlerRegistry>,
    frame: RequestFrame,
    peer: SocketAddr,
    connection_id: ConnectionId,
    timeout: Duration,
) -> ResponseFrame {
    let start = Instant::now();
    let command = frame.command;

    let response = match registry.get(&command) {
        None => {
            tracing::debug!(connection_id = %connection_id, command = %command, "Unknown command");
            ResponseFrame::new(Status::UnknownCommand, format!("unknown command '{}'", command))
        }
        Some(handler) => {
            let request = Request {
                command: command.clone(),
                payload: frame.payload,
                peer,
                connection_id,
            };
            let span = tracing::debug_span!("dispatch", connection_id = %connection_id, command = %command);
            match registry
                .call("dispatch", |r| r.invoke(handler, request, timeout))
                .instrument(span)
                .await
            {
                Ok(payload) => ResponseFrame::ok(payload),
                Err(e) => ResponseFrame::new(Status::HandlerError, e.to_string()),
            }
        }
    };

    metrics::record_tcp_request(&command, response.status.as_str(), start);
    response
}
