//! Circuit breaker for outbound dependencies.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: target assumed down, calls fail fast
//! - Half-Open: a single probe tests whether the target recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: after open_duration (next caller becomes the probe)
//! Half-Open → Closed: half_open_trials consecutive probe successes
//! Half-Open → Open: any failure, open timer restarts
//! ```
//!
//! # Design Decisions
//! - One breaker per target key, created lazily, kept for the process lifetime
//! - Each breaker has its own lock; different keys never contend
//! - Fail fast in Open state (the operation is never invoked)
//! - Single probe in Half-Open; concurrent callers are refused until it resolves
//! - Permits carry the epoch they were issued in; a result from an earlier
//!   Open/Half-Open cycle never moves the current one (Closed failures still count)

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::{CallError, CircuitOpenError};
use crate::observability::metrics;

/// Capacity of the transition event channel. Slow subscribers lag, never block.
const TRANSITION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted whenever a breaker changes state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub key: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Thresholds applied to every breaker in a registry.
#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_duration: Duration,
    pub half_open_trials: u32,
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            open_duration: config.open_duration(),
            half_open_trials: config.half_open_trials.max(1),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
    /// Bumped on every transition into Open or HalfOpen.
    epoch: u64,
}

/// Breaker for a single target key.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
    transitions: broadcast::Sender<StateTransition>,
}

impl CircuitBreaker {
    fn new(
        key: String,
        settings: BreakerSettings,
        transitions: broadcast::Sender<StateTransition>,
    ) -> Self {
        Self {
            key,
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                last_failure: None,
                probe_in_flight: false,
                epoch: 0,
            }),
            transitions,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask to make a call. The returned permit must be resolved with
    /// [`CallPermit::success`] or [`CallPermit::failure`].
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, CircuitOpenError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(self.permit(false, inner.epoch)),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.settings.open_duration {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(self.permit(true, inner.epoch))
                } else {
                    Err(self.open_error(self.settings.open_duration - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.open_error(Duration::ZERO))
                } else {
                    inner.probe_in_flight = true;
                    Ok(self.permit(true, inner.epoch))
                }
            }
        }
    }

    fn permit(self: &Arc<Self>, probe: bool, epoch: u64) -> CallPermit {
        CallPermit {
            breaker: Arc::clone(self),
            probe,
            epoch,
            resolved: false,
        }
    }

    fn open_error(&self, retry_after: Duration) -> CircuitOpenError {
        CircuitOpenError {
            key: self.key.clone(),
            retry_after,
        }
    }

    fn record_success(&self, probe: bool, epoch: u64) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                // Only the probe of the current half-open window is a trial.
                if probe && epoch == inner.epoch {
                    inner.consecutive_failures = 0;
                    inner.probe_in_flight = false;
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.settings.half_open_trials {
                        inner.half_open_successes = 0;
                        inner.opened_at = None;
                        self.transition(&mut inner, CircuitState::Closed);
                    }
                }
            }
            // Stale result from a call admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                inner.last_failure = Some(now);
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            // Stale failure from a call admitted in an earlier cycle.
            CircuitState::HalfOpen if epoch != inner.epoch => {}
            CircuitState::HalfOpen => {
                inner.last_failure = Some(now);
                inner.probe_in_flight = false;
                inner.half_open_successes = 0;
                inner.opened_at = Some(now);
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        if matches!(to, CircuitState::Open | CircuitState::HalfOpen) {
            inner.epoch += 1;
        }

        match to {
            CircuitState::Open => tracing::warn!(
                target_key = %self.key,
                from = %from,
                failures = inner.consecutive_failures,
                open_for = ?self.settings.open_duration,
                "Circuit opened"
            ),
            _ => tracing::info!(target_key = %self.key, from = %from, to = %to, "Circuit state changed"),
        }
        metrics::record_breaker_transition(&self.key, to);

        // No subscribers is fine.
        let _ = self.transitions.send(StateTransition {
            key: self.key.clone(),
            from,
            to,
        });
    }

    fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            key: self.key.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            last_failure_ago_ms: inner.last_failure.map(|t| t.elapsed().as_millis() as u64),
        }
    }
}

/// Permission to make one call through a breaker.
///
/// Dropping an unresolved permit counts as a failure, so a cancelled
/// half-open probe reopens the circuit instead of wedging it.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    epoch: u64,
    resolved: bool,
}

impl CallPermit {
    /// Whether this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success(self.probe, self.epoch);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure(self.epoch);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::debug!(target_key = %self.breaker.key, probe = self.probe, "Call permit dropped unresolved");
            self.breaker.record_failure(self.epoch);
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub last_failure_ago_ms: Option<u64>,
}

/// Process-wide set of breakers keyed by target.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    settings: BreakerSettings,
    transitions: broadcast::Sender<StateTransition>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            breakers: DashMap::new(),
            settings,
            transitions,
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(BreakerSettings::from(config))
    }

    /// Get or lazily create the breaker for `key`.
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                tracing::debug!(target_key = %key, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(
                    key.to_string(),
                    self.settings,
                    self.transitions.clone(),
                ))
            })
            .clone()
    }

    pub fn try_acquire(&self, key: &str) -> Result<CallPermit, CircuitOpenError> {
        self.breaker(key).try_acquire()
    }

    /// Run `operation` through the breaker for `key`.
    pub async fn call<F, Fut, T, E>(&self, key: &str, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire(key)?;
        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(CallError::Inner(e))
            }
        }
    }

    /// Current state, `None` if the key has never been called.
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.breakers.get(key).map(|b| b.state())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }
}
