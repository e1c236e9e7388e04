//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define audit pipeline metrics (connections, transactions, writes)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `audit_active_connections` (gauge): live accepted connections
//! - `audit_transactions_total` (counter): observed events by phase
//! - `audit_records_written_total` (counter): records appended to the log
//! - `audit_write_failures_total` (counter): records the log rejected
//! - `audit_capture_bytes_total` (counter): artifact bytes by phase
//! - `audit_pinning_rejections_total` (counter): untrusted origin certificates
//! - `audit_correlation_errors_total` (counter): pairing defects
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Labels are static strings only

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use crate::error::StartupError;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), StartupError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| StartupError::Metrics(e.to_string()))?;

    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn set_active_connections(count: usize) {
    gauge!("audit_active_connections").set(count as f64);
}

/// `phase` is one of `request`, `response`, `transport_error`.
pub fn record_transaction(phase: &'static str) {
    counter!("audit_transactions_total", "phase" => phase).increment(1);
}

pub fn record_audit_write(ok: bool) {
    if ok {
        counter!("audit_records_written_total").increment(1);
    } else {
        counter!("audit_write_failures_total").increment(1);
    }
}

/// `phase` is the artifact leaf (`req` or `res`).
pub fn record_capture_bytes(phase: &'static str, bytes: u64) {
    counter!("audit_capture_bytes_total", "phase" => phase).increment(bytes);
}

pub fn record_pinning_rejection() {
    counter!("audit_pinning_rejections_total").increment(1);
}

pub fn record_correlation_error() {
    counter!("audit_correlation_errors_total").increment(1);
}
