//! Backend core library: circuit-breaker-guarded HTTP retries, buffered log
//! event persistence, a framed TCP server/client and a periodic scheduler.

pub mod admin;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;

pub use config::AppConfig;
pub use lifecycle::{App, Shutdown};
