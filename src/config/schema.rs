//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the service.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// TCP listener settings.
    pub tcp: TcpConfig,

    /// Circuit breaker thresholds, shared by every target key.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Default outbound HTTP retry policy.
    pub retries: RetryConfig,

    /// Log event buffering, flushing and retention.
    pub events: EventsConfig,

    /// Admin status API.
    pub admin: AdminConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// TCP server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Bind address (e.g., "0.0.0.0:9000").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Largest accepted frame body in bytes.
    pub max_frame_len: usize,

    /// Per-request deadline: handler run time on the server, response wait on the client.
    pub request_timeout_ms: u64,

    /// How long shutdown waits for in-flight connections.
    pub shutdown_grace_ms: u64,

    /// A connection that sends no frame for this long is closed.
    pub idle_timeout_ms: u64,
}

impl TcpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9000".to_string(),
            max_connections: 1_000,
            max_frame_len: 1024 * 1024, // 1MB
            request_timeout_ms: 5_000,
            shutdown_grace_ms: 5_000,
            idle_timeout_ms: 60_000,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// How long the circuit stays open before a probe is allowed.
    pub open_duration_ms: u64,

    /// Consecutive successful probes needed to close again.
    pub half_open_trials: u32,
}

impl CircuitBreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_ms: 5_000,
            half_open_trials: 1,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Growth factor applied per attempt.
    pub multiplier: f64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Add up to 10% random jitter to each delay.
    pub jitter: bool,

    /// Finished delivery jobs are forgotten after this long.
    pub job_retention_secs: u64,

    /// How often finished jobs past retention are purged.
    pub job_cleanup_interval_secs: u64,
}

impl RetryConfig {
    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn job_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.job_cleanup_interval_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 2000,
            jitter: true,
            job_retention_secs: 24 * 60 * 60,
            job_cleanup_interval_secs: 60 * 60,
        }
    }
}

/// Log event manager configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Flush cycle interval in milliseconds.
    pub flush_interval_ms: u64,

    /// Buffered events that trigger a flush before the interval elapses.
    pub flush_batch_size: usize,

    /// Failed flushes a batch survives before it is dropped.
    pub max_flush_retries: u32,

    /// Buffer capacity; ingest beyond this drops the event.
    pub max_buffered: usize,

    /// Events older than this are deleted by cleanup.
    pub retention_secs: u64,

    /// Cleanup cycle interval in seconds.
    pub cleanup_interval_secs: u64,

    /// Rows deleted per cleanup batch.
    pub cleanup_batch_size: usize,

    /// SQLite database path. In-memory store when unset.
    pub store_path: Option<String>,
}

impl EventsConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 5_000,
            flush_batch_size: 20,
            max_flush_retries: 3,
            max_buffered: 10_000,
            retention_secs: 180 * 24 * 60 * 60, // ~6 months
            cleanup_interval_secs: 24 * 60 * 60,
            cleanup_batch_size: 1_000,
            store_path: None,
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// "pretty" or "json".
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
