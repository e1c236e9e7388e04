//! Shutdown coordination for the proxy.

use std::io;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::audit::AuditSink;
use crate::error::Error;
use crate::net::ShutdownHandle;

/// Everything that has to be stopped, in the order it is stopped.
///
/// 1. The listener stops accepting and the live connections drain.
/// 2. The server task finishes.
/// 3. Body captures still closing (dropped mid-stream) finish flushing.
/// 4. The audit sink drains its queue and closes the log.
///
/// Records and artifacts produced by the last connections are therefore
/// always complete before the sink closes.
pub struct Shutdown {
    listener: ShutdownHandle,
    server: JoinHandle<io::Result<()>>,
    captures: TaskTracker,
    audit: AuditSink,
}

impl Shutdown {
    pub fn new(
        listener: ShutdownHandle,
        server: JoinHandle<io::Result<()>>,
        captures: TaskTracker,
        audit: AuditSink,
    ) -> Self {
        Self {
            listener,
            server,
            captures,
            audit,
        }
    }

    pub fn listener(&self) -> &ShutdownHandle {
        &self.listener
    }

    /// Run the shutdown sequence. The audit sink is closed even when the
    /// server task failed; the first error is returned.
    pub async fn run(self) -> Result<(), Error> {
        let drained = self.listener.initiate_shutdown();
        drained.await;
        tracing::info!("All connections closed");

        let served = match self.server.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(e) => Err(Error::Server(e.to_string())),
        };
        if let Err(e) = &served {
            tracing::error!(error = %e, "Server task ended with an error");
        }

        self.captures.close();
        if !self.captures.is_empty() {
            tracing::info!(pending = self.captures.len(), "Waiting for body captures to close");
        }
        self.captures.wait().await;

        let closed = self.audit.close().await;
        served?;
        closed?;
        tracing::info!("Shutdown complete");
        Ok(())
    }
}
