//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize all subsystems in dependency order
//! - Bind the listener and begin accepting traffic
//! - Hand back a running proxy that knows how to stop itself
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listeners start last (traffic only when ready)

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

use super::shutdown::Shutdown;
use crate::audit::{ArtifactStore, AuditSink};
use crate::config::AuditConfig;
use crate::correlation::{Correlator, CorrelatorSettings};
use crate::error::{Error, StartupError};
use crate::http::{build_client, AppState, HttpServer};
use crate::net::{ShutdownHandle, TrackedListener};
use crate::observability::metrics;
use crate::security::PinningGate;

/// A proxy that is accepting traffic.
pub struct RunningProxy {
    local_addr: SocketAddr,
    shutdown: Shutdown,
}

impl RunningProxy {
    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.listener().clone()
    }

    pub fn active_connections(&self) -> usize {
        self.shutdown.listener().active_connections()
    }

    /// Drain connections, then close the audit log.
    pub async fn stop(self) -> Result<(), Error> {
        self.shutdown.run().await
    }

    /// Serve until `signal` resolves, then stop.
    pub async fn run_until<F>(self, signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.stop().await
    }
}

/// Bring up storage, the audit sink, the engine and the listener.
pub async fn start(config: &AuditConfig) -> Result<RunningProxy, StartupError> {
    let base = &config.storage.base_path;
    tokio::fs::create_dir_all(base)
        .await
        .map_err(|source| StartupError::Storage {
            path: base.clone(),
            source,
        })?;

    let store = ArtifactStore::new(base.clone(), config.storage.compression);
    let audit = AuditSink::open(store.log_path()).await?;

    let settings =
        CorrelatorSettings::from_config(&config.capture).map_err(|e| StartupError::Config(e.to_string()))?;
    tracing::info!(
        trace_header = %settings.trace_header,
        debug_header = %settings.debug_header,
        log_all = settings.log_all,
        no_trace = ?settings.no_trace,
        "Capture rules loaded"
    );
    let correlator = Correlator::new(settings, store, audit.handle());

    let gate = PinningGate::from_config(&config.tls).map_err(|e| StartupError::Tls(e.to_string()))?;
    if gate.is_enabled() {
        tracing::info!(trusted = gate.trusted_count(), "Certificate pinning enabled");
    }
    let client = build_client(gate, &config.timeouts)?;

    if config.observability.metrics_enabled {
        let addr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|e| StartupError::Metrics(format!("{}: {e}", config.observability.metrics_address)))?;
        metrics::init_metrics(addr)?;
    }

    let captures = TaskTracker::new();
    let state = AppState {
        correlator: Arc::new(correlator),
        client,
        request_timeout: Duration::from_secs(config.timeouts.request_secs),
        captures: captures.clone(),
    };
    let server = HttpServer::new(state);

    let listener = TrackedListener::bind(&config.listener).await?;
    let local_addr = listener.local_addr().map_err(|source| StartupError::Bind {
        addr: config.listener.bind_address.clone(),
        source,
    })?;
    let handle = listener.shutdown_handle();
    let task = tokio::spawn(server.run(listener, handle.clone()));

    Ok(RunningProxy {
        local_addr,
        shutdown: Shutdown::new(handle, task, captures, audit),
    })
}
