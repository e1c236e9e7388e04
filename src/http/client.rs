//! Upstream HTTP client.
//!
//! Plain `http://` origins go over a bare TCP connection; `https://`
//! origins over rustls, with certificate trust decided by the
//! [`PinningVerifier`].

use axum::body::Body;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;

use crate::config::TimeoutConfig;
use crate::error::StartupError;
use crate::security::{PinningGate, PinningVerifier};

pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Build the shared upstream client.
pub fn build_client(gate: PinningGate, timeouts: &TimeoutConfig) -> Result<UpstreamClient, StartupError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let pinned = gate.is_enabled();
    let verifier = PinningVerifier::new(gate, Arc::clone(&provider))?;

    let tls = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| StartupError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(Duration::from_secs(timeouts.connect_secs)));

    let https = HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    tracing::debug!(
        pinned,
        connect_timeout_secs = timeouts.connect_secs,
        "Upstream client ready"
    );

    Ok(Client::builder(TokioExecutor::new()).build(https))
}
