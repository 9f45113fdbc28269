//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → breakers, retry manager, event store → scheduler → listeners
//!
//! Scheduler (scheduler.rs):
//!     Task table → coordinator → one run per task at a time
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections → Stop scheduler → Final flush
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown (second signal forces exit)
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Shutdown has a timeout: connections still open after the grace period are closed

pub mod scheduler;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use scheduler::Scheduler;
pub use shutdown::{Shutdown, ShutdownSignal};
pub use startup::App;
