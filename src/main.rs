//! mitm-audit
//!
//! An audit pipeline for an intercepting HTTP proxy: every captured
//! request/response pair is correlated, its bodies streamed to disk, and
//! its records appended to a single audit log.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────────────┐
//!                     │                     AUDIT PROXY                      │
//!                     │                                                      │
//!   Client Request    │  ┌──────────┐    ┌──────────┐    ┌───────────────┐   │
//!   ──────────────────┼─▶│   net    │───▶│   http   │───▶│  correlation  │   │
//!                     │  │ listener │    │  server  │    │  (on_request) │   │
//!                     │  └──────────┘    └────┬─────┘    └───────┬───────┘   │
//!                     │                       │                  │ records   │
//!                     │                       ▼                  ▼           │
//!                     │                ┌────────────┐     ┌────────────┐     │
//!                     │  bodies ──────▶│  capture   │     │   audit    │     │
//!                     │                │ req / res  │     │ sink → log │     │
//!                     │                └────────────┘     └────────────┘     │
//!                     │                       │                              │
//!   Client Response   │                  ┌────┴─────┐    ┌───────────────┐   │
//!   ◀─────────────────┼──────────────────│  http    │◀───│   security    │◀──┼── Origin
//!                     │                  │  client  │    │   pinning     │   │
//!                     │                  └──────────┘    └───────────────┘   │
//!                     └──────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;

use mitm_audit::config::{loader, AuditConfig};
use mitm_audit::correlation::NoTracePolicy;
use mitm_audit::capture::SinkFlavor;
use mitm_audit::lifecycle;
use mitm_audit::observability::logging;

/// Intercepting-proxy audit recorder
#[derive(Parser, Debug)]
#[command(name = "mitm-audit", version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML); flags below override it
    #[arg(short, long, env = "MITM_AUDIT_CONFIG")]
    config: Option<PathBuf>,

    /// Address the proxy listens on
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,

    /// Log every proxied request, not just captured ones
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the audit log and body artifacts
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Gzip body artifacts
    #[arg(long)]
    gzip: bool,

    /// Header carrying the trace ID
    #[arg(long = "trace-id-header")]
    trace_id_header: Option<String>,

    /// Header marking a request for capture
    #[arg(long = "debug-header")]
    debug_header: Option<String>,

    /// Capture every request even without the debug header
    #[arg(long)]
    log_all: bool,

    /// Capture requests without a trace ID under a generated one
    #[arg(long, alias = "ignore-missing-trace")]
    synthesize_trace_id: bool,

    /// Only trust origin certificates listed in the configuration
    #[arg(long = "fingerprint-check")]
    fingerprint_check: bool,

    /// Trusted origin certificate fingerprint (SHA-256 hex); repeatable
    #[arg(long = "trust")]
    trust: Vec<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(self, config: &mut AuditConfig) {
        if let Some(listen) = self.listen {
            config.listener.bind_address = listen;
        }
        if let Some(storage) = self.storage {
            config.storage.base_path = storage;
        }
        if self.gzip {
            config.storage.compression = SinkFlavor::Gzip;
        }
        if let Some(header) = self.trace_id_header {
            config.capture.trace_header = header;
        }
        if let Some(header) = self.debug_header {
            config.capture.debug_header = header;
        }
        config.capture.log_all |= self.log_all;
        if self.synthesize_trace_id {
            config.capture.no_trace = NoTracePolicy::Synthesize;
        }
        config.tls.require_pinning |= self.fingerprint_check;
        config.tls.trusted_fingerprints.extend(self.trust);
        config.observability.verbose |= self.verbose;
        config.observability.json_logs |= self.json_logs;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => loader::read_config(path)?,
        None => AuditConfig::default(),
    };
    cli.apply(&mut config);

    logging::init(config.observability.verbose, config.observability.json_logs)?;
    tracing::info!("mitm-audit v{} starting", env!("CARGO_PKG_VERSION"));

    loader::validate(&config)?;

    tracing::info!(
        bind_address = %config.listener.bind_address,
        storage = %config.storage.base_path.display(),
        compression = ?config.storage.compression,
        pinning = config.tls.require_pinning,
        "Configuration loaded"
    );

    let proxy = lifecycle::start(&config).await?;
    tracing::info!(address = %proxy.local_addr(), "Listening for connections");

    proxy.run_until(lifecycle::shutdown_signal()).await?;
    Ok(())
}
