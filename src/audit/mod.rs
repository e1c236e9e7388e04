//! Audit trail subsystem.
//!
//! # Data Flow
//! ```text
//! correlator (many transactions, concurrently)
//!     → sink.rs (AuditHandle::submit, unbounded queue, never blocks)
//!     → single writer task
//!     → record.rs (text serialization)
//!     → <root>/log (append-only)
//!
//! store.rs maps (trace, transaction) to artifact directories
//! ```
//!
//! # Design Decisions
//! - Only the writer task touches the log file; no locks around it
//! - Write errors are logged per record, the first is returned on close
//! - Records are appended, never rewritten

pub mod record;
pub mod sink;
pub mod store;

pub use record::{RecordKind, TransactionRecord};
pub use sink::{AuditHandle, AuditSink};
pub use store::ArtifactStore;
