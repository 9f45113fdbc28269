//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound call:
//!     → circuit_breaker.rs (fail fast if the target's circuit is open)
//!     → HttpTransport::send (per-attempt timeout)
//!     → On failure: retries.rs (classify, back off via backoff.rs, try again)
//!     → Every outcome is reported back to the breaker
//!
//! Background delivery:
//!     → jobs.rs (record the job, wait for the jobs it is ordered after)
//!     → retries.rs deliver (execute, waiting out an open circuit)
//!     → jobs.rs (terminal status, purged after the retention window)
//! ```
//!
//! # Design Decisions
//! - Breakers are keyed per target; one failing dependency never trips another
//! - Retries stop at the first non-retryable outcome
//! - Backoff is capped; jitter is opt-in per policy

pub mod backoff;
pub mod circuit_breaker;
pub mod jobs;
pub mod retries;

pub use circuit_breaker::{CircuitBreakerRegistry, CircuitState};
pub use jobs::{JobRecord, JobStatus, JobTable};
pub use retries::{HttpRetryManager, RetryPolicy};
