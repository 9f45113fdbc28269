//! Log event subsystem.
//!
//! # Data Flow
//! ```text
//! Producers (TCP EVENT handler, admin API)
//!     → manager.rs (buffer, scheduled flush, re-queue on failure)
//!     → store.rs (EventStore: memory or JSON file)
//!     → manager.rs cleanup (retention window, bounded batches)
//! ```

pub mod manager;
pub mod store;
pub mod types;

pub use manager::{EventManagerSettings, EventStats, LogEventManager};
pub use store::{EventStore, SqliteEventStore, MemoryEventStore};
pub use types::LogEvent;
