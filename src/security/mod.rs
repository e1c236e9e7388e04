//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Upstream TLS handshake:
//!     → pinning.rs (PinningVerifier inside the rustls client config)
//!     → PinningGate (SHA-256 of the leaf against the trusted set)
//!     → handshake continues, or fails with a transport error
//! ```
//!
//! # Design Decisions
//! - Fail closed: an unlisted leaf aborts the connection attempt
//! - No trust in origin input: a pinned gate never falls back to CA roots

pub mod pinning;

pub use pinning::{parse_fingerprint, Fingerprint, PinningGate, PinningVerifier};
