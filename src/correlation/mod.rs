//! Transaction correlation subsystem.
//!
//! # Data Flow
//! ```text
//! request hook
//!     → correlator.rs (capture gate, trace policy, mint transaction ID)
//!     → context.rs (TransactionContext parked in SessionSlot)
//!     → audit (request record)
//!
//! response hook (same SessionSlot, possibly another task)
//!     → correlator.rs (slot lookup, state check)
//!     → audit (response or transport-error record)
//! ```
//!
//! # Design Decisions
//! - The slot is a tagged enum; a missing or finalized context is an error
//! - An abandoned exchange is finalized with a transport error on drop
//! - Transaction IDs are always generated, independent of the trace ID
//! - Trace IDs become directory names, so they are validated first

pub mod context;
pub mod correlator;

pub use context::{Completion, SessionId, SessionSlot, TraceOrigin, TransactionContext};
pub use correlator::{
    Correlator, CorrelatorSettings, ExchangeGuard, NoTracePolicy, ResponseOutcome, CLIENT_DISCONNECTED,
    FLAGGED_TRACE_ID,
};
