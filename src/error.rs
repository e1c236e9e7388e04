//! Error taxonomy for the audit pipeline.
//!
//! Each subsystem owns its error enum; [`Error`] unifies them for callers
//! that drive the whole process (startup and shutdown).

use std::path::PathBuf;
use thiserror::Error;

/// Request/response pairing failures.
///
/// These indicate a defect in the pairing machinery and are always
/// reported, never silently dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("response observed without a transaction context in the session slot")]
    MissingContext,

    #[error("request observed on a session slot that already holds a transaction")]
    AlreadyObserved,

    #[error("event observed for finalized transaction {transaction_id}")]
    AlreadyFinalized { transaction_id: String },
}

/// Audit log failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit sink is closed")]
    Closed,

    #[error("failed to open audit log {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("failed to write audit record: {0}")]
    Write(String),

    #[error("audit writer task failed: {0}")]
    Writer(String),
}

/// Body capture failures, surfaced once when the capture closes.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to create artifact directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write artifact {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to close artifact {path}: {source}")]
    Close {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("capture was abandoned before it closed")]
    Abandoned,
}

/// Certificate pinning rejection. Fatal to a single upstream connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrustError {
    #[error("certificate not trusted (sha256 {fingerprint})")]
    Untrusted { fingerprint: String },

    #[error("no certificate presented")]
    NoCertificate,
}

/// Errors returned by the shutdown-aware acceptor.
#[derive(Error, Debug)]
pub enum AcceptError {
    /// The underlying acceptor failed. The error is passed through as-is.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("listener is shutting down")]
    ShuttingDown,
}

/// Startup failures. All of them abort before traffic is served.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("cannot create storage directory {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("metrics exporter failed: {0}")]
    Metrics(String),
}

/// Crate-level error.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("server task failed: {0}")]
    Server(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for crate-level operations.
pub type Result<T> = std::result::Result<T, Error>;
