//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, thresholds > 0, task intervals capped)
//! - Validate addresses parse before anything binds
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AppConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::AppConfig;

/// Largest frame the TCP server may be configured to accept.
const MAX_FRAME_CEILING: usize = 16 * 1024 * 1024;

/// Longest interval a scheduled task may be configured with.
const MAX_TASK_INTERVAL_SECS: u64 = 366 * 24 * 60 * 60;

/// A single semantic problem with a config field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validate a parsed configuration.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let tcp = &config.tcp;
    if tcp.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "tcp.bind_address",
            format!("'{}' is not a socket address", tcp.bind_address),
        ));
    }
    if tcp.max_connections == 0 {
        errors.push(ValidationError::new("tcp.max_connections", "must be > 0"));
    }
    // One command byte plus at least one command character.
    if tcp.max_frame_len < 2 || tcp.max_frame_len > MAX_FRAME_CEILING {
        errors.push(ValidationError::new(
            "tcp.max_frame_len",
            format!("must be within 2..={}", MAX_FRAME_CEILING),
        ));
    }
    if tcp.request_timeout_ms == 0 {
        errors.push(ValidationError::new("tcp.request_timeout_ms", "must be > 0"));
    }
    check_interval(&mut errors, "tcp.idle_timeout_ms", tcp.idle_timeout_ms / 1_000);
    if tcp.idle_timeout_ms == 0 {
        errors.push(ValidationError::new("tcp.idle_timeout_ms", "must be > 0"));
    }

    let cb = &config.circuit_breaker;
    if cb.failure_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.failure_threshold", "must be > 0"));
    }
    if cb.open_duration_ms == 0 {
        errors.push(ValidationError::new("circuit_breaker.open_duration_ms", "must be > 0"));
    }
    if cb.half_open_trials == 0 {
        errors.push(ValidationError::new("circuit_breaker.half_open_trials", "must be > 0"));
    }

    let retries = &config.retries;
    if retries.max_attempts == 0 {
        errors.push(ValidationError::new("retries.max_attempts", "must be > 0"));
    }
    if !retries.multiplier.is_finite() || retries.multiplier < 1.0 {
        errors.push(ValidationError::new("retries.multiplier", "must be >= 1.0"));
    }
    if retries.base_delay_ms > retries.max_delay_ms {
        errors.push(ValidationError::new(
            "retries.base_delay_ms",
            "must not exceed retries.max_delay_ms",
        ));
    }
    if retries.job_retention_secs == 0 {
        errors.push(ValidationError::new("retries.job_retention_secs", "must be > 0"));
    }
    if retries.job_cleanup_interval_secs == 0 {
        errors.push(ValidationError::new("retries.job_cleanup_interval_secs", "must be > 0"));
    }
    check_interval(
        &mut errors,
        "retries.job_cleanup_interval_secs",
        retries.job_cleanup_interval_secs,
    );

    let events = &config.events;
    check_interval(&mut errors, "events.flush_interval_ms", events.flush_interval_ms / 1_000);
    if events.flush_interval_ms == 0 {
        errors.push(ValidationError::new("events.flush_interval_ms", "must be > 0"));
    }
    if events.max_buffered == 0 {
        errors.push(ValidationError::new("events.max_buffered", "must be > 0"));
    }
    if events.flush_batch_size == 0 || events.flush_batch_size > events.max_buffered {
        errors.push(ValidationError::new(
            "events.flush_batch_size",
            "must be within 1..=events.max_buffered",
        ));
    }
    if events.retention_secs == 0 {
        errors.push(ValidationError::new("events.retention_secs", "must be > 0"));
    }
    if events.cleanup_interval_secs == 0 {
        errors.push(ValidationError::new("events.cleanup_interval_secs", "must be > 0"));
    }
    check_interval(&mut errors, "events.cleanup_interval_secs", events.cleanup_interval_secs);
    if events.cleanup_batch_size == 0 {
        errors.push(ValidationError::new("events.cleanup_batch_size", "must be > 0"));
    }

    if config.admin.enabled && config.admin.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "admin.bind_address",
            format!("'{}' is not a socket address", config.admin.bind_address),
        ));
    }

    let obs = &config.observability;
    if !matches!(obs.log_format.as_str(), "pretty" | "json") {
        errors.push(ValidationError::new(
            "observability.log_format",
            "must be \"pretty\" or \"json\"",
        ));
    }
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", obs.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_interval(errors: &mut Vec<ValidationError>, field: &'static str, secs: u64) {
    if secs > MAX_TASK_INTERVAL_SECS {
        errors.push(ValidationError::new(
            field,
            format!("must not exceed {} seconds", MAX_TASK_INTERVAL_SECS),
        ));
    }
}
