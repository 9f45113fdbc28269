//! Admin status API.
//!
//! # Routes
//! - `GET  /health`: liveness
//! - `GET  /admin/status`: version, uptime, connections, event and task stats
//! - `GET  /admin/breakers`: per-target circuit state
//! - `GET  /admin/events?limit=N`: most recent persisted events
//! - `POST /admin/events`: ingest one event
//! - `GET  /admin/http-retry`: every tracked delivery job
//! - `POST /admin/http-retry`: queue a background delivery, optionally `after` other jobs
//! - `GET  /admin/http-retry/{id}`: one job's status and outcome
//! - `DELETE /admin/http-retry/{id}`: cancel and forget a job
//! - `GET  /admin/peers`: connected TCP clients
//! - `POST /admin/peers/send`: push a message to one connected client
//! - `POST /admin/tasks/{name}/run`: trigger a scheduled task now

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;

use self::handlers::*;
use crate::events::LogEventManager;
use crate::lifecycle::scheduler::Scheduler;
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::net::connection::ConnectionTracker;
use crate::observability::Logged;
use crate::resilience::{CircuitBreakerRegistry, HttpRetryManager, RetryPolicy};

/// Shared handles injected into handlers.
#[derive(Clone)]
pub struct AdminState {
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub events: Arc<Logged<LogEventManager>>,
    pub scheduler: Arc<Scheduler>,
    pub retry_manager: Arc<Logged<HttpRetryManager>>,
    pub retry_policy: RetryPolicy,
    pub connections: ConnectionTracker,
    pub started_at: Instant,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/admin/status", get(get_status))
        .route("/admin/breakers", get(get_breakers))
        .route("/admin/events", get(get_events).post(post_event))
        .route("/admin/http-retry", get(list_http_retry).post(post_http_retry))
        .route("/admin/http-retry/{id}", get(get_http_retry).delete(delete_http_retry))
        .route("/admin/peers", get(get_peers))
        .route("/admin/peers/send", post(send_to_peer))
        .route("/admin/tasks/{name}/run", post(run_task))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the admin API until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: AdminState, mut shutdown: ShutdownSignal) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin API listening");

    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move { shutdown.recv().await })
        .await?;

    tracing::info!("Admin API stopped");
    Ok(())
}
