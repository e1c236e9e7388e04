//! Body capture subsystem.
//!
//! # Data Flow
//! ```text
//! origin/client body
//!     → body.rs (CaptureBody: poll frame, write to sink, yield frame)
//!     → proxy pipeline (unchanged bytes)
//!
//! side effect:
//!     → sink.rs (ArtifactSink: plain or gzip file, opened on first byte)
//!     → CaptureHandle (outcome at close)
//! ```
//!
//! # Design Decisions
//! - Write-then-yield: the proxy sees a frame only after it reached the sink
//! - Sink errors stay off the data path and are reported once at close
//! - Nothing is created on disk for bodies that carry no data

pub mod body;
pub mod sink;

pub use body::{CaptureBody, CaptureHandle, CaptureSummary};
pub use sink::{ArtifactDir, ArtifactSink, SinkFlavor};
