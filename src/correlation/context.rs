//! Per-transaction identity and the typed session slot that carries it
//! from the request hook to the response hook.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::capture::ArtifactDir;

/// Global counter for session IDs.
/// Relaxed ordering is enough since only uniqueness matters.
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier of one proxied transaction, printed as `Session:` in records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Generate a new unique session ID.
    pub fn new() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a transaction's trace identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOrigin {
    /// Supplied by the client in the trace header.
    Header,
    /// Generated because the header was missing.
    Synthesized,
    /// Header missing; captured under the shared placeholder trace.
    Flagged,
}

/// Identity of one in-flight request/response cycle.
///
/// Cloning shares the artifact directory handle, so the request and the
/// response capture create the directory only once between them.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    trace_id: String,
    transaction_id: String,
    origin: TraceOrigin,
    session: SessionId,
    peer: SocketAddr,
    dir: Arc<ArtifactDir>,
}

impl TransactionContext {
    pub fn new(
        trace_id: String,
        origin: TraceOrigin,
        transaction_id: String,
        peer: SocketAddr,
        dir: ArtifactDir,
    ) -> Self {
        Self {
            trace_id,
            transaction_id,
            origin,
            session: SessionId::new(),
            peer,
            dir: Arc::new(dir),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn origin(&self) -> TraceOrigin {
        self.origin
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn dir(&self) -> &Arc<ArtifactDir> {
        &self.dir
    }

    /// Path of the artifact with the given leaf name.
    pub fn artifact_path(&self, leaf: &str) -> PathBuf {
        self.dir.path().join(leaf)
    }
}

/// How a finalized transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Response,
    TransportFailed,
    /// The request was never captured, so neither was the response.
    Skipped,
}

/// Per-session storage handed to both hooks by the engine.
///
/// ```text
/// Empty ──request──▶ Observed(ctx) ──response/transport error──▶ Finalized
///   └────request (not captured)──▶ Skipped ──response──▶ Finalized
/// ```
#[derive(Debug, Default)]
pub enum SessionSlot {
    #[default]
    Empty,
    Skipped,
    Observed(TransactionContext),
    Finalized {
        transaction_id: Option<String>,
        completion: Completion,
    },
}

impl SessionSlot {
    /// The in-flight context, if the request was captured and no response
    /// has been observed yet.
    pub fn context(&self) -> Option<&TransactionContext> {
        match self {
            SessionSlot::Observed(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self, SessionSlot::Finalized { .. })
    }
}
