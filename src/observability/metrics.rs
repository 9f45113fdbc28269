//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define backend-core metrics (breakers, retries, event pipeline, TCP)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `breaker_transitions_total` (counter): state changes by target and new state
//! - `http_retry_attempts_total` (counter): attempts by target and outcome
//! - `log_events_ingested_total` / `log_events_flushed_total` (counter)
//! - `log_events_dropped_total` (counter): by reason (buffer_full, retries_exhausted)
//! - `log_events_deleted_total` (counter): removed by retention cleanup
//! - `log_events_buffered` (gauge): events waiting for the next flush
//! - `tcp_connections_active` (gauge): current connection count
//! - `tcp_frames_total` (counter): requests by command and response status
//! - `tcp_request_duration_seconds` (histogram): handler latency
//! - `scheduler_runs_total` (counter): task runs by task and outcome
//! - `component_errors_total` (counter): failures seen by the logging guard
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - Target keys are used as labels; cardinality follows the number of dependencies

use std::net::SocketAddr;
use std::time::Instant;

use ::metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_breaker_transition(key: &str, to: CircuitState) {
    counter!("breaker_transitions_total", "target" => key.to_string(), "state" => to.as_str()).increment(1);
}

pub fn record_retry_attempt(key: &str, outcome: &'static str) {
    counter!("http_retry_attempts_total", "target" => key.to_string(), "outcome" => outcome).increment(1);
}

pub fn record_events_ingested(count: usize) {
    counter!("log_events_ingested_total").increment(count as u64);
}

pub fn record_events_flushed(count: usize) {
    counter!("log_events_flushed_total").increment(count as u64);
}

pub fn record_events_dropped(reason: &'static str, count: usize) {
    counter!("log_events_dropped_total", "reason" => reason).increment(count as u64);
}

pub fn record_events_deleted(count: usize) {
    counter!("log_events_deleted_total").increment(count as u64);
}

pub fn record_event_buffer_size(size: usize) {
    gauge!("log_events_buffered").set(size as f64);
}

pub fn record_active_connections(count: u64) {
    gauge!("tcp_connections_active").set(count as f64);
}

pub fn record_tcp_request(command: &str, status: &'static str, start: Instant) {
    counter!("tcp_frames_total", "command" => command.to_string(), "status" => status).increment(1);
    histogram!("tcp_request_duration_seconds", "command" => command.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_scheduler_run(task: &str, outcome: &'static str) {
    counter!("scheduler_runs_total", "task" => task.to_string(), "outcome" => outcome).increment(1);
}

pub fn record_component_error(component: &'static str, operation: &'static str) {
    counter!("component_errors_total", "component" => component, "operation" => operation).increment(1);
}
