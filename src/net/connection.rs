//! Connection lifetime tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count live connections and signal when the count reaches zero
//! - Release each connection's slot exactly once, however often it is closed

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{watch, OwnedSemaphorePermit};

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts live connections.
///
/// The count lives in a watch channel so waiters wake on every change
/// instead of polling.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    live: Arc<watch::Sender<usize>>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { live: Arc::new(tx) }
    }

    /// Record a new live connection. The returned guard releases it.
    pub fn track(&self) -> ConnectionGuard {
        let mut count = 0;
        self.live.send_modify(|n| {
            *n += 1;
            count = *n;
        });
        metrics::set_active_connections(count);
        ConnectionGuard {
            live: Some(Arc::clone(&self.live)),
            id: ConnectionId::new(),
        }
    }

    /// Get current live connection count.
    pub fn active_count(&self) -> usize {
        *self.live.borrow()
    }

    /// Future that resolves once no connection is live.
    pub fn quiescent(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.live.subscribe();
        async move {
            let _ = rx.wait_for(|n| *n == 0).await;
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
/// Releases its slot on the first [`release`](Self::release) or on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    live: Option<Arc<watch::Sender<usize>>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Release the slot. Returns `false` if it was already released.
    pub fn release(&mut self) -> bool {
        let Some(live) = self.live.take() else {
            return false;
        };
        let mut count = 0;
        live.send_modify(|n| {
            *n = n.saturating_sub(1);
            count = *n;
        });
        metrics::set_active_connections(count);
        tracing::trace!(connection_id = %self.id, live = count, "Connection closed");
        true
    }

    pub fn is_released(&self) -> bool {
        self.live.is_none()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// An accepted connection that counts itself live until closed.
#[derive(Debug)]
pub struct TrackedStream<S> {
    inner: S,
    guard: ConnectionGuard,
    permit: Option<OwnedSemaphorePermit>,
    peer: SocketAddr,
}

impl<S> TrackedStream<S> {
    pub(crate) fn new(inner: S, guard: ConnectionGuard, permit: OwnedSemaphorePermit, peer: SocketAddr) -> Self {
        Self {
            inner,
            guard,
            permit: Some(permit),
            peer,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.guard.id()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mark the connection closed. Idempotent; dropping the stream has the
    /// same effect if this was never called.
    pub fn close(&mut self) -> bool {
        self.permit.take();
        self.guard.release()
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_released()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
