//! Outbound HTTP subsystem.
//!
//! # Data Flow
//! ```text
//! RequestSpec (request.rs)
//!     → HttpRetryManager (resilience/retries.rs)
//!     → HttpTransport::send (transport.rs)
//!     → HttpResponse | TransportError
//! ```

pub mod request;
pub mod transport;

pub use request::{RequestSpec, RequestTemplate};
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport};
