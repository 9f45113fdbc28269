//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (identity, live-connection tracking, peer registry)
//!     → server.rs (per-connection task: read frame → handler → write frame)
//!     → codec.rs (length-prefixed framing)
//!
//! Outgoing:
//!     client.rs → codec.rs → server
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Frame lengths validated before any allocation

pub mod client;
pub mod codec;
pub mod connection;
pub mod listener;
pub mod server;

pub use client::TcpClient;
pub use codec::{RequestFrame, ResponseFrame, Status};
pub use connection::PeerInfo;
pub use server::{DispatchError, Handler, HandlerError, HandlerRegistry, Request, TcpServer};
