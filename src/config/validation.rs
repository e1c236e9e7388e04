//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Check header names and pinned fingerprints are well formed
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AuditConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::AuditConfig;
use crate::correlation::CorrelatorSettings;
use crate::security::pinning::parse_fingerprint;

/// A single semantic problem with the configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Check a configuration, collecting every error found.
pub fn validate_config(config: &AuditConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("{:?} is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    let capture = &config.capture;
    for (field, value) in [
        ("capture.trace_header", &capture.trace_header),
        ("capture.debug_header", &capture.debug_header),
    ] {
        if value.trim().is_empty() {
            errors.push(ValidationError::new(field, "must not be empty"));
        }
    }
    if errors.iter().all(|e| !e.field.starts_with("capture.")) {
        match CorrelatorSettings::from_config(capture) {
            Ok(settings) if settings.trace_header == settings.debug_header => {
                errors.push(ValidationError::new(
                    "capture.debug_header",
                    "must differ from capture.trace_header",
                ));
            }
            Ok(_) => {}
            Err(e) => errors.push(e),
        }
    }

    if config.storage.base_path.as_os_str().is_empty() {
        errors.push(ValidationError::new("storage.base_path", "must not be empty"));
    }

    for fingerprint in &config.tls.trusted_fingerprints {
        if let Err(reason) = parse_fingerprint(fingerprint) {
            errors.push(ValidationError::new(
                "tls.trusted_fingerprints",
                format!("{fingerprint:?}: {reason}"),
            ));
        }
    }
    if config.tls.require_pinning && config.tls.trusted_fingerprints.is_empty() {
        errors.push(ValidationError::new(
            "tls.trusted_fingerprints",
            "pinning is required but no fingerprints are trusted",
        ));
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::new("timeouts.connect_secs", "must be greater than 0"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("{:?} is not a socket address", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
