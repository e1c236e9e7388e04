//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the audit
//! proxy. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::capture::SinkFlavor;
use crate::correlation::NoTracePolicy;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AuditConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Which transactions are captured and how they are identified.
    pub capture: CaptureConfig,

    /// Where records and body artifacts are written.
    pub storage: StorageConfig,

    /// Upstream certificate pinning.
    pub tls: TlsConfig,

    /// Upstream timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Capture rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Header carrying the caller's trace ID.
    pub trace_header: String,

    /// Header whose presence marks a request for capture.
    pub debug_header: String,

    /// Capture every request, debug header or not.
    pub log_all: bool,

    /// Policy for captured requests without a usable trace ID.
    pub no_trace: NoTracePolicy,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            trace_header: "X-Trace-ID".to_string(),
            debug_header: "X-Debug".to_string(),
            log_all: false,
            no_trace: NoTracePolicy::Drop,
        }
    }
}

/// Storage layout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory holding `log` and the per-trace artifact trees.
    pub base_path: PathBuf,

    /// Artifact encoding.
    pub compression: SinkFlavor,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./db"),
            compression: SinkFlavor::Plain,
        }
    }
}

/// Upstream certificate pinning.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Only accept origin leaf certificates whose SHA-256 is listed below.
    pub require_pinning: bool,

    /// Hex SHA-256 fingerprints; colons and case are ignored.
    pub trusted_fingerprints: Vec<String>,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Debug-level logging for this crate.
    pub verbose: bool,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: AuditConfig = toml::from_str("").unwrap();
        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");
        assert_eq!(config.capture.trace_header, "X-Trace-ID");
        assert_eq!(config.capture.debug_header, "X-Debug");
        assert_eq!(config.capture.no_trace, NoTracePolicy::Drop);
        assert_eq!(config.storage.base_path, PathBuf::from("./db"));
        assert!(!config.tls.require_pinning);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: AuditConfig = toml::from_str(
            r#"
            [capture]
            log_all = true
            no_trace = "synthesize"

            [storage]
            compression = "gzip"

            [tls]
            require_pinning = true
            trusted_fingerprints = ["ab:cd"]
            "#,
        )
        .unwrap();
        assert!(config.capture.log_all);
        assert_eq!(config.capture.no_trace, NoTracePolicy::Synthesize);
        assert_eq!(config.capture.trace_header, "X-Trace-ID");
        assert_eq!(config.storage.compression, SinkFlavor::Gzip);
        assert_eq!(config.tls.trusted_fingerprints, vec!["ab:cd".to_string()]);
        assert_eq!(config.listener.max_connections, 10_000);
    }
}
