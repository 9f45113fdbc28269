//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize all subsystems in dependency order
//! - Register the built-in TCP handlers and scheduled tasks
//! - Bind listeners and run until shutdown, then stop in reverse order
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners are bound in `build` so callers learn the real addresses
//! - Shutdown order: TCP drain, scheduler stop, delivery job cancellation,
//!   final event flush, admin API

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::Instant;

use crate::admin::{self, AdminState};
use crate::config::AppConfig;
use crate::error::PersistenceError;
use crate::events::{EventManagerSettings, EventStore, LogEvent, LogEventManager, MemoryEventStore, SqliteEventStore};
use crate::http::ReqwestTransport;
use crate::lifecycle::scheduler::{Scheduler, SchedulerError};
use crate::lifecycle::shutdown::Shutdown;
use crate::net::listener::ListenerError;
use crate::net::connection::PeerInfo;
use crate::net::server::{HandlerError, HandlerRegistry, Request, TcpServer};
use crate::observability::Logged;
use crate::resilience::{CircuitBreakerRegistry, HttpRetryManager, RetryPolicy};

/// Event type recorded for frames received through the `EVENT` command.
pub const TCP_RECEIVE_EVENT: &str = "tcp.receive";
/// Event type recorded when a TCP client goes away.
pub const TCP_DISCONNECT_EVENT: &str = "tcp.disconnect";

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("TCP listener: {0}")]
    Listener(#[from] ListenerError),

    #[error("admin API bind failed: {0}")]
    AdminBind(std::io::Error),

    #[error("event store: {0}")]
    Store(#[from] PersistenceError),

    #[error("scheduler: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// A fully wired backend-core process.
pub struct App {
    shutdown: Shutdown,
    breakers: Arc<CircuitBreakerRegistry>,
    retry_manager: Arc<Logged<HttpRetryManager>>,
    events: Arc<Logged<LogEventManager>>,
    scheduler: Arc<Scheduler>,
    tcp: TcpServer,
    admin: Option<(TcpListener, AdminState)>,
}

impl App {
    pub async fn build(config: AppConfig) -> Result<Self, StartupError> {
        let shutdown = Shutdown::new();

        let breakers = Arc::new(CircuitBreakerRegistry::from_config(&config.circuit_breaker));
        let retry_manager = Arc::new(Logged::new(
            "http_retry",
            HttpRetryManager::new(Arc::new(ReqwestTransport::new()), Arc::clone(&breakers)),
        ));

        let store: Arc<dyn EventStore> = match &config.events.store_path {
            Some(path) => Arc::new(SqliteEventStore::open(path).await?),
            None => {
                tracing::warn!("No event store path configured, events are kept in memory only");
                Arc::new(MemoryEventStore::new())
            }
        };
        let events = Arc::new(Logged::new(
            "log_events",
            LogEventManager::new(store, EventManagerSettings::from(&config.events)),
        ));

        let scheduler = Arc::new(Scheduler::new());
        LogEventManager::schedule(&events, &scheduler)?;
        HttpRetryManager::schedule(
            &retry_manager,
            &scheduler,
            config.retries.job_retention(),
            config.retries.job_cleanup_interval(),
        )?;

        let tcp = TcpServer::bind(&config.tcp, default_handlers(Arc::clone(&events))).await?;

        let admin = if config.admin.enabled {
            let listener = TcpListener::bind(&config.admin.bind_address)
                .await
                .map_err(StartupError::AdminBind)?;
            let state = AdminState {
                breakers: Arc::clone(&breakers),
                events: Arc::clone(&events),
                scheduler: Arc::clone(&scheduler),
                retry_manager: Arc::clone(&retry_manager),
                retry_policy: RetryPolicy::from_config(&config.retries),
                connections: tcp.tracker(),
                started_at: Instant::now(),
            };
            Some((listener, state))
        } else {
            None
        };

        Ok(Self {
            shutdown,
            breakers,
            retry_manager,
            events,
            scheduler,
            tcp,
            admin,
        })
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn tcp_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin.as_ref().and_then(|(listener, _)| listener.local_addr().ok())
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn retry_manager(&self) -> &Arc<Logged<HttpRetryManager>> {
        &self.retry_manager
    }

    pub fn events(&self) -> &Arc<Logged<LogEventManager>> {
        &self.events
    }

    /// Run until the shutdown handle is triggered.
    pub async fn run(self) -> Result<(), StartupError> {
        self.scheduler.start()?;

        let admin_task = self.admin.map(|(listener, state)| {
            let signal = self.shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = admin::serve(listener, state, signal).await {
                    tracing::error!(error = %e, "Admin API failed");
                }
            })
        });

        let tcp_result = self.tcp.run(self.shutdown.subscribe()).await;
        // The TCP server only returns early on a fatal listener error.
        self.shutdown.trigger();

        self.scheduler.shutdown().await;
        self.retry_manager.shutdown();
        // Failures are logged by the guard; remaining events are reported lost.
        let _ = self.events.call("shutdown", |manager| manager.shutdown()).await;

        if let Some(task) = admin_task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Admin API task failed");
            }
        }

        tracing::info!("Shutdown complete");
        tcp_result.map_err(StartupError::from)
    }
}

/// `PING`, `ECHO` and `EVENT` handlers, plus a disconnect event per closed client.
pub fn default_handlers(events: Arc<Logged<LogEventManager>>) -> HandlerRegistry {
    let disconnect_events = Arc::clone(&events);
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn("PING", |_| async { Ok(b"PONG".to_vec()) })
        .register_fn("ECHO", |request: Request| async move { Ok(request.payload) })
        .register_fn("EVENT", move |request: Request| {
            let events = Arc::clone(&events);
            async move {
                let event = received_event(&request);
                if events.ingest(event) {
                    Ok(b"ACCEPTED".to_vec())
                } else {
                    Err(HandlerError::from("event buffer full"))
                }
            }
        });
    registry.on_disconnect(move |peer: &PeerInfo| {
        if !disconnect_events.ingest(disconnect_event(peer)) {
            tracing::warn!(peer = %peer.peer, "Event buffer full, disconnect not recorded");
        }
    });
    registry
}

/// JSON payloads are kept as-is; anything else is stored as text.
fn received_event(request: &Request) -> LogEvent {
    let payload = serde_json::from_slice(&request.payload)
        .unwrap_or_else(|_| serde_json::json!({ "data": String::from_utf8_lossy(&request.payload) }));
    LogEvent::new(TCP_RECEIVE_EVENT, payload).with_source(request.peer.to_string())
}

fn disconnect_event(peer: &PeerInfo) -> LogEvent {
    let connected_secs = (chrono::Utc::now() - peer.connected_at).num_seconds();
    LogEvent::new(
        TCP_DISCONNECT_EVENT,
        serde_json::json!({ "connection_id": peer.connection_id, "connected_secs": connected_secs }),
    )
    .with_source(peer.peer.to_string())
}
