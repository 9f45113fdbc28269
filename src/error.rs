//! Error taxonomy shared by the resilience, events, and net subsystems.
//!
//! # Propagation
//! - `CircuitOpenError` / `RetryError`: surfaced to callers of the retry manager
//! - `PersistenceError`: retried inside the log event manager, logged on give-up
//! - `ProtocolError`: connection-local, closes only the offending connection
//! - `TcpClientError`: surfaced to the client caller (includes timeouts)

use std::time::Duration;
use thiserror::Error;

use crate::resilience::retries::RetryAttempt;

/// The breaker for `key` is refusing calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit open for '{key}' (retry after {retry_after:?})")]
pub struct CircuitOpenError {
    /// Target key the breaker guards.
    pub key: String,
    /// Remaining open time. Zero while a half-open probe is in flight.
    pub retry_after: Duration,
}

/// Wrapper returned by [`CircuitBreakerRegistry::call`](crate::resilience::circuit_breaker::CircuitBreakerRegistry::call).
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The operation was not invoked.
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

/// Outbound HTTP failure that is not an HTTP status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// Every attempt failed with a retryable outcome.
#[derive(Debug, Clone, Error)]
#[error("retries exhausted for '{key}' after {} attempts: {}", .attempts.len(), describe_last(.attempts))]
pub struct RetryExhaustedError {
    pub key: String,
    pub attempts: Vec<RetryAttempt>,
}

impl RetryExhaustedError {
    /// Description of the final failed attempt.
    pub fn last_error(&self) -> String {
        describe_last(&self.attempts)
    }
}

fn describe_last(attempts: &[RetryAttempt]) -> String {
    attempts
        .last()
        .map(|a| a.outcome.to_string())
        .unwrap_or_else(|| "no attempts".to_string())
}

/// Errors surfaced by [`HttpRetryManager::execute`](crate::resilience::retries::HttpRetryManager::execute).
#[derive(Debug, Clone, Error)]
pub enum RetryError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    Exhausted(#[from] RetryExhaustedError),

    /// Failed with an outcome the policy does not retry.
    #[error("non-retryable failure for '{key}': {}", describe_last(.attempts))]
    NonRetryable {
        key: String,
        attempts: Vec<RetryAttempt>,
    },
}

impl RetryError {
    /// Attempt history, empty when the breaker refused the first attempt.
    pub fn attempts(&self) -> &[RetryAttempt] {
        match self {
            RetryError::CircuitOpen(_) => &[],
            RetryError::Exhausted(e) => &e.attempts,
            RetryError::NonRetryable { attempts, .. } => attempts,
        }
    }
}

/// Background delivery job lookup failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("no delivery job {0}")]
    NotFound(uuid::Uuid),

    #[error("dependency {0} is not a known delivery job")]
    UnknownDependency(uuid::Uuid),
}

/// Event store operation failed.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Malformed TCP frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("zero-length frame")]
    EmptyFrame,

    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("command length {cmd_len} overruns frame body of {available} bytes")]
    CommandOverrun { cmd_len: usize, available: usize },

    #[error("empty command")]
    EmptyCommand,

    #[error("command is not valid UTF-8")]
    InvalidCommand,

    #[error("command of {0} bytes exceeds 255")]
    CommandTooLong(usize),

    #[error("unknown response status {0}")]
    UnknownStatus(u8),

    #[error("expected a pushed frame, got status {0}")]
    UnexpectedStatus(u8),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server-side push to a connected peer failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("no client connected from {0}")]
    NotConnected(std::net::SocketAddr),

    #[error("outbound queue for {0} is full")]
    Backlogged(std::net::SocketAddr),
}

/// TCP client failure.
#[derive(Debug, Error)]
pub enum TcpClientError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connect failed: {0}")]
    Connect(std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
