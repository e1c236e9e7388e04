//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, connection limit, shutdown gate)
//!     → connection.rs (live count, idempotent close)
//!     → Hand off to the engine (axum serve)
//!
//! Shutdown:
//!     initiate_shutdown → stop accepting → Drained resolves at zero live
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Acceptor errors are never rewritten; the caller decides what to do

pub mod connection;
pub mod listener;

pub use connection::{ConnectionId, ConnectionTracker, TrackedStream};
pub use listener::{Acceptor, Drained, ShutdownHandle, TrackedListener};
