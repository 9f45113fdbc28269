//! Retry logic for outbound HTTP calls.
//!
//! # Responsibilities
//! - Classify each attempt's outcome (retryable or not)
//! - Execute retries with capped exponential backoff (+ optional jitter)
//! - Report every outcome to the circuit breaker for the request's target
//!
//! # Design Decisions
//! - Open circuit aborts immediately and does not consume an attempt
//! - Timeouts, connection errors, 5xx, 408 and 429 are retryable by default
//! - Other 4xx surface at once; the remaining attempts are not used
//! - Backoff sleeps suspend only the calling task
//! - Background deliveries are tracked in a job table and can be ordered
//!   after other jobs or cancelled by id

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::error::{JobError, RetryError, RetryExhaustedError, TransportError};
use crate::http::{HttpResponse, HttpTransport, RequestSpec};
use crate::lifecycle::scheduler::{Scheduler, SchedulerError, TaskError};
use crate::observability::{metrics, Logged};
use crate::resilience::backoff::{calculate_backoff, with_jitter};
use crate::resilience::circuit_breaker::CircuitBreakerRegistry;
use crate::resilience::jobs::{JobRecord, JobStatus, JobTable};

pub const JOB_CLEANUP_TASK: &str = "http_retry.cleanup";

/// A failed attempt's outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The target answered with a non-success status.
    Status(u16),
    /// No HTTP response at all.
    Transport(TransportError),
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Status(code) => write!(f, "HTTP {}", code),
            AttemptOutcome::Transport(e) => write!(f, "{}", e),
        }
    }
}

/// One failed attempt, kept for the caller's error report.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Delay slept before the next attempt (zero for the final one).
    pub delay: Duration,
    pub outcome: AttemptOutcome,
    /// Response body or error text.
    pub payload: Option<String>,
}

type RetryPredicate = Arc<dyn Fn(&AttemptOutcome) -> bool + Send + Sync>;

/// Default classification.
pub fn is_retryable(outcome: &AttemptOutcome) -> bool {
    match outcome {
        AttemptOutcome::Transport(_) => true,
        AttemptOutcome::Status(code) => *code >= 500 || *code == 408 || *code == 429,
    }
}

/// How an outbound call is retried. Immutable once shared.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
    backoff_multiplier: f64,
    backoff_cap: Duration,
    jitter: bool,
    retryable: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("backoff_cap", &self.backoff_cap)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl RetryPolicy {
    /// Policy without jitter using the default retryable predicate.
    pub fn new(max_attempts: u32, backoff_base: Duration, backoff_multiplier: f64, backoff_cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            backoff_multiplier: if backoff_multiplier.is_finite() {
                backoff_multiplier.max(1.0)
            } else {
                1.0
            },
            backoff_cap,
            jitter: false,
            retryable: Arc::new(is_retryable),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            config.multiplier,
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(config.jitter)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retryable<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&AttemptOutcome) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_retryable(&self, outcome: &AttemptOutcome) -> bool {
        (self.retryable)(outcome)
    }

    /// Delay after `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = calculate_backoff(
            attempt,
            self.backoff_base.as_millis() as u64,
            self.backoff_multiplier,
            self.backoff_cap.as_millis() as u64,
        );
        if self.jitter {
            with_jitter(delay)
        } else {
            delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Executes outbound calls with retries behind the circuit breaker.
pub struct HttpRetryManager {
    transport: Arc<dyn HttpTransport>,
    breakers: Arc<CircuitBreakerRegistry>,
    jobs: JobTable,
}

impl HttpRetryManager {
    pub fn new(transport: Arc<dyn HttpTransport>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            transport,
            breakers,
            jobs: JobTable::new(),
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Send `request`, retrying per `policy`.
    ///
    /// Returns the first successful response. Cancel by dropping the future
    /// (e.g. under `tokio::time::timeout`).
    pub async fn execute(&self, request: &RequestSpec, policy: &RetryPolicy) -> Result<HttpResponse, RetryError> {
        let key = request.target_key();
        let mut history = Vec::new();
        let mut attempt = 0u32;

        loop {
            let permit = self.breakers.try_acquire(&key)?;
            attempt += 1;

            let (outcome, payload) = match self.transport.send(request).await {
                Ok(response) if response.is_success() => {
                    permit.success();
                    metrics::record_retry_attempt(&key, "success");
                    if attempt > 1 {
                        tracing::info!(target_key = %key, attempt, "Request succeeded after retry");
                    }
                    return Ok(response);
                }
                Ok(response) => {
                    let body = response.text();
                    (AttemptOutcome::Status(response.status), (!body.is_empty()).then_some(body))
                }
                Err(e) => {
                    let text = e.to_string();
                    (AttemptOutcome::Transport(e), Some(text))
                }
            };
            permit.failure();

            if !policy.is_retryable(&outcome) {
                metrics::record_retry_attempt(&key, "non_retryable");
                tracing::warn!(
                    target_key = %key,
                    url = %request.url,
                    attempt,
                    outcome = %outcome,
                    "Request failed, not retryable"
                );
                history.push(RetryAttempt {
                    attempt,
                    delay: Duration::ZERO,
                    outcome,
                    payload,
                });
                return Err(RetryError::NonRetryable { key, attempts: history });
            }

            if attempt >= policy.max_attempts() {
                metrics::record_retry_attempt(&key, "exhausted");
                tracing::error!(
                    target_key = %key,
                    url = %request.url,
                    attempts = attempt,
                    outcome = %outcome,
                    "Request failed, retries exhausted"
                );
                history.push(RetryAttempt {
                    attempt,
                    delay: Duration::ZERO,
                    outcome,
                    payload,
                });
                return Err(RetryExhaustedError { key, attempts: history }.into());
            }

            let delay = policy.delay_for(attempt);
            metrics::record_retry_attempt(&key, "retry");
            tracing::info!(
                target_key = %key,
                attempt,
                delay = ?delay,
                outcome = %outcome,
                "Retrying request"
            );
            history.push(RetryAttempt {
                attempt,
                delay,
                outcome,
                payload,
            });
            tokio::time::sleep(delay).await;
        }
    }

    /// `execute`, except that an open circuit is waited out instead of
    /// failing, up to `policy.max_attempts()` waits.
    pub async fn deliver(&self, request: &RequestSpec, policy: &RetryPolicy) -> Result<HttpResponse, RetryError> {
        let mut circuit_waits = 0;
        loop {
            match self.execute(request, policy).await {
                Err(RetryError::CircuitOpen(open)) if circuit_waits < policy.max_attempts() => {
                    circuit_waits += 1;
                    let wait = open.retry_after.max(policy.delay_for(1));
                    tracing::warn!(target_key = %open.key, wait = ?wait, "Circuit open, deferring delivery");
                    tokio::time::sleep(wait).await;
                }
                other => return other,
            }
        }
    }

    /// Background delivery jobs, for lookup and cancellation.
    pub fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    /// Deliver `request` in the background once every job in `after` has
    /// finished, whatever their outcome.
    ///
    /// Fails without starting anything if `after` names an unknown job.
    pub fn submit(
        manager: &Arc<Logged<Self>>,
        request: RequestSpec,
        policy: RetryPolicy,
        after: Vec<Uuid>,
    ) -> Result<Uuid, JobError> {
        let dependencies = manager.jobs.dependencies(&after)?;
        let job_id = Uuid::new_v4();
        manager.jobs.insert(JobRecord::new(job_id, &request, after));

        let m = Arc::clone(manager);
        let span = tracing::info_span!("delivery", job_id = %job_id, url = %request.url);
        let handle = tokio::spawn(
            async move {
                for mut done in dependencies {
                    // A removed dependency closes its channel, which also releases us.
                    let _ = done.wait_for(|finished| *finished).await;
                }
                m.jobs.mark_running(job_id);

                let result = m.call("deliver", |inner| inner.deliver(&request, &policy)).await;
                let recorded = match &result {
                    Ok(response) => m.jobs.finish(job_id, JobStatus::Succeeded, Some(response.status), None),
                    Err(e) => m.jobs.finish(job_id, JobStatus::Failed, last_status(e), Some(e.to_string())),
                };
                if recorded {
                    match result {
                        Ok(response) => tracing::info!(status = response.status, "Delivery completed"),
                        Err(_) => tracing::info!("Delivery job failed"),
                    }
                }
            }
            .instrument(span),
        );
        manager.jobs.set_abort(job_id, handle.abort_handle());
        Ok(job_id)
    }

    /// Forget finished jobs older than `retention`. Returns how many were dropped.
    pub fn purge_finished(&self, retention: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        match cutoff {
            Some(cutoff) => self.jobs.purge_finished_before(cutoff),
            None => 0,
        }
    }

    /// Register the periodic purge of finished jobs.
    pub fn schedule(
        manager: &Arc<Logged<Self>>,
        scheduler: &Scheduler,
        retention: Duration,
        interval: Duration,
    ) -> Result<(), SchedulerError> {
        let m = Arc::clone(manager);
        scheduler.every(JOB_CLEANUP_TASK, interval, move || {
            let m = Arc::clone(&m);
            async move {
                let purged = m.purge_finished(retention);
                if purged > 0 {
                    tracing::debug!(purged, "Purged finished delivery jobs");
                }
                Ok::<(), TaskError>(())
            }
        })
    }

    /// Cancel every job still waiting or running.
    pub fn shutdown(&self) {
        let cancelled = self.jobs.cancel_all("shutdown");
        if !cancelled.is_empty() {
            tracing::warn!(count = cancelled.len(), jobs = ?cancelled, "Cancelled unfinished delivery jobs");
        }
    }
}

/// Status code of the last attempt, when the target answered at all.
fn last_status(error: &RetryError) -> Option<u16> {
    match error.attempts().last().map(|a| &a.outcome) {
        Some(AttemptOutcome::Status(code)) => Some(*code),
        _ => None,
    }
}
