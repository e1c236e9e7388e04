//! Shutdown-aware listener.
//!
//! # Responsibilities
//! - Wrap an underlying acceptor and pass its errors through unchanged
//! - Enforce max_connections limit via semaphore
//! - Count every accepted connection live until it closes
//! - Stop accepting on shutdown and signal when the last connection closes

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};

use super::connection::{ConnectionTracker, TrackedStream};
use crate::config::ListenerConfig;
use crate::error::{AcceptError, StartupError};

/// Source of raw connections.
pub trait Acceptor: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Acceptor for TcpListener {
    type Io = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// A bounded listener whose connections are tracked for graceful shutdown.
pub struct TrackedListener<A = TcpListener> {
    /// The underlying acceptor.
    inner: A,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    /// Configured maximum connections.
    max_connections: usize,
    tracker: ConnectionTracker,
    stopping: Arc<watch::Sender<bool>>,
}

impl TrackedListener<TcpListener> {
    /// Bind to the configured address with connection limits.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, StartupError> {
        let bind_error = |source| StartupError::Bind {
            addr: config.bind_address.clone(),
            source,
        };
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|e| bind_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        tracing::info!(
            address = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self::new(listener, config.max_connections))
    }
}

impl<A: Acceptor> TrackedListener<A> {
    pub fn new(inner: A, max_connections: usize) -> Self {
        let (stopping, _) = watch::channel(false);
        Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            tracker: ConnectionTracker::new(),
            stopping: Arc::new(stopping),
        }
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Waits while the limit is reached. Errors from the underlying
    /// acceptor are returned as [`AcceptError::Io`] untouched; once
    /// shutdown has begun every call returns [`AcceptError::ShuttingDown`].
    pub async fn accept(&self) -> Result<(TrackedStream<A::Io>, SocketAddr), AcceptError> {
        let mut stopping = self.stopping.subscribe();
        if *stopping.borrow_and_update() {
            return Err(AcceptError::ShuttingDown);
        }

        // Acquire permit first (backpressure)
        let permit = tokio::select! {
            biased;
            _ = stopped(&mut stopping) => return Err(AcceptError::ShuttingDown),
            permit = Arc::clone(&self.connection_limit).acquire_owned() => {
                permit.map_err(|_| AcceptError::ShuttingDown)?
            }
        };

        let (io, addr) = tokio::select! {
            biased;
            _ = stopped(&mut stopping) => return Err(AcceptError::ShuttingDown),
            accepted = self.inner.accept() => accepted?,
        };

        let guard = self.tracker.track();
        tracing::debug!(
            peer_addr = %addr,
            connection_id = %guard.id(),
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((TrackedStream::new(io, guard, permit, addr), addr))
    }

    /// Stop accepting and return a future that resolves once every
    /// accepted connection has closed. Calling it again is harmless.
    pub fn initiate_shutdown(&self) -> Drained {
        self.shutdown_handle().initiate_shutdown()
    }

    /// Handle for triggering shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stopping: Arc::clone(&self.stopping),
            tracker: self.tracker.clone(),
        }
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn active_connections(&self) -> usize {
        self.tracker.active_count()
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopping| *stopping).await;
}

/// Clonable trigger for a listener's shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stopping: Arc<watch::Sender<bool>>,
    tracker: ConnectionTracker,
}

impl ShutdownHandle {
    pub fn initiate_shutdown(&self) -> Drained {
        if !self.stopping.send_replace(true) {
            tracing::info!(
                live_connections = self.tracker.active_count(),
                "Listener stopped accepting, draining connections"
            );
        }
        Drained {
            inner: Box::pin(self.tracker.quiescent()),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Resolves once shutdown has been initiated.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.stopping.subscribe();
        async move { stopped(&mut rx).await }
    }

    pub fn active_connections(&self) -> usize {
        self.tracker.active_count()
    }
}

/// Resolves when the live-connection count reaches zero.
///
/// Has no deadline of its own; race it against a timer if one is needed.
pub struct Drained {
    inner: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl Future for Drained {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.inner.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for Drained {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drained").finish_non_exhaustive()
    }
}

impl<A: Acceptor> axum::serve::Listener for TrackedListener<A> {
    type Io = TrackedStream<A::Io>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match TrackedListener::accept(&*self).await {
                Ok(accepted) => return accepted,
                Err(AcceptError::ShuttingDown) => std::future::pending::<()>().await,
                Err(AcceptError::Io(e)) if is_connection_error(&e) => {
                    tracing::debug!(error = %e, "Connection failed during accept");
                }
                Err(AcceptError::Io(e)) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    tracing::error!(error = %e, "Accept failed, retrying in 1s");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}
