//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Tracked connection
//!     → server.rs (Axum setup, request hook, request body capture)
//!     → request.rs (validate target, strip hop-by-hop headers)
//!     → client.rs (forward to origin, TLS trust via pinning)
//!     → server.rs (response hook, response body capture)
//!     → response.rs (map upstream failures)
//!     → Send to client
//! ```

pub mod client;
pub mod request;
pub mod response;
pub mod server;

pub use client::{build_client, UpstreamClient};
pub use server::{AppState, HttpServer, PeerInfo};
