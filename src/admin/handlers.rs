use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use uuid::Uuid;

use super::AdminState;
use crate::error::{JobError, PushError};
use crate::events::{EventStats, LogEvent};
use crate::http::{RequestSpec, RequestTemplate};
use crate::lifecycle::scheduler::{SchedulerError, TaskStats};
use crate::net::PeerInfo;
use crate::resilience::circuit_breaker::BreakerSnapshot;
use crate::resilience::{HttpRetryManager, JobRecord};

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub tcp_connections: u64,
    pub active_jobs: usize,
    pub events: EventStats,
    pub tasks: Vec<TaskStats>,
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started_at.elapsed().as_secs(),
        tcp_connections: state.connections.active_count(),
        active_jobs: state.retry_manager.jobs().active_count(),
        events: state.events.stats(),
        tasks: state.scheduler.stats(),
    })
}

pub async fn get_breakers(State(state): State<AdminState>) -> Json<Vec<BreakerSnapshot>> {
    Json(state.breakers.snapshot())
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn get_events(
    State(state): State<AdminState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<LogEvent>>, ApiError> {
    state
        .events
        .call("recent", |manager| manager.store().recent(query.limit.min(1_000)))
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}

pub async fn post_event(
    State(state): State<AdminState>,
    Json(event): Json<LogEvent>,
) -> Result<StatusCode, ApiError> {
    if event.event_type.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "event_type must not be empty"));
    }
    let event = LogEvent {
        id: None,
        source: event.source.or_else(|| Some("admin".to_string())),
        ..event
    };
    if state.events.ingest(event) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(api_error(StatusCode::SERVICE_UNAVAILABLE, "event buffer full"))
    }
}

#[derive(Serialize)]
pub struct DeliveryAccepted {
    pub job_id: Uuid,
    pub target: String,
}

/// A request template plus the jobs it must wait for.
#[derive(Debug, Deserialize)]
pub struct DeliveryRequest {
    #[serde(flatten)]
    pub template: RequestTemplate,
    #[serde(default)]
    pub after: Vec<Uuid>,
}

pub async fn post_http_retry(
    State(state): State<AdminState>,
    Json(delivery): Json<DeliveryRequest>,
) -> Result<(StatusCode, Json<DeliveryAccepted>), ApiError> {
    let spec =
        RequestSpec::try_from(delivery.template).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    let target = spec.target_key();
    let job_id = HttpRetryManager::submit(&state.retry_manager, spec, state.retry_policy.clone(), delivery.after)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    tracing::info!(job_id = %job_id, target_key = %target, "Delivery job accepted");
    Ok((StatusCode::ACCEPTED, Json(DeliveryAccepted { job_id, target })))
}

pub async fn list_http_retry(State(state): State<AdminState>) -> Json<Vec<JobRecord>> {
    Json(state.retry_manager.jobs().list())
}

pub async fn get_http_retry(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobRecord>, ApiError> {
    state
        .retry_manager
        .jobs()
        .get(id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, JobError::NotFound(id).to_string()))
}

/// Cancel the job if it is still active and forget it.
pub async fn delete_http_retry(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobRecord>, ApiError> {
    let record = state
        .retry_manager
        .jobs()
        .remove(id)
        .map_err(|e| api_error(StatusCode::NOT_FOUND, e.to_string()))?;
    tracing::info!(job_id = %id, status = ?record.status, "Delivery job removed");
    Ok(Json(record))
}

pub async fn get_peers(State(state): State<AdminState>) -> Json<Vec<PeerInfo>> {
    Json(state.connections.peers())
}

#[derive(Debug, Deserialize)]
pub struct PeerMessage {
    pub peer: SocketAddr,
    pub message: String,
}

pub async fn send_to_peer(
    State(state): State<AdminState>,
    Json(body): Json<PeerMessage>,
) -> Result<StatusCode, ApiError> {
    match state.connections.send_to(body.peer, body.message.into_bytes()) {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(e @ PushError::NotConnected(_)) => Err(api_error(StatusCode::NOT_FOUND, e.to_string())),
        Err(e @ PushError::Backlogged(_)) => Err(api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }
}

pub async fn run_task(State(state): State<AdminState>, Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    match state.scheduler.run_now(&name) {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(e @ SchedulerError::UnknownTask(_)) => Err(api_error(StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => Err(api_error(StatusCode::CONFLICT, e.to_string())),
    }
}
