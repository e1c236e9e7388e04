//! Upstream certificate pinning.
//!
//! # Responsibilities
//! - Hold the fixed set of trusted leaf fingerprints (SHA-256)
//! - Accept or reject an origin's leaf certificate
//! - Plug into rustls as the client-side certificate verifier
//!
//! # Design Decisions
//! - With pinning on, the pin replaces chain validation entirely, so
//!   self-signed origins can be pinned
//! - Handshake signatures are always checked against the leaf key
//! - The trusted set is built once at startup and never mutated

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, OtherError, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::config::TlsConfig;
use crate::error::{StartupError, TrustError};
use crate::observability::metrics;

/// SHA-256 digest of a DER-encoded certificate.
pub type Fingerprint = [u8; 32];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FingerprintError {
    #[error("not hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

/// Parse a hex fingerprint. Colons, whitespace and case are ignored.
pub fn parse_fingerprint(text: &str) -> Result<Fingerprint, FingerprintError> {
    let digits: String = text.chars().filter(|c| *c != ':' && !c.is_whitespace()).collect();
    let bytes = hex::decode(digits)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| FingerprintError::Length(len))
}

pub fn fingerprint(der: &[u8]) -> Fingerprint {
    Sha256::digest(der).into()
}

/// Decides whether an origin's leaf certificate is trusted.
#[derive(Debug, Clone)]
pub struct PinningGate {
    enabled: bool,
    trusted: Arc<HashSet<Fingerprint>>,
}

impl PinningGate {
    /// A gate that trusts everything (chain validation still applies).
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            trusted: Arc::new(HashSet::new()),
        }
    }

    pub fn pinned(trusted: impl IntoIterator<Item = Fingerprint>) -> Self {
        Self {
            enabled: true,
            trusted: Arc::new(trusted.into_iter().collect()),
        }
    }

    pub fn from_config(config: &TlsConfig) -> Result<Self, FingerprintError> {
        if !config.require_pinning {
            return Ok(Self::disabled());
        }
        let trusted = config
            .trusted_fingerprints
            .iter()
            .map(|f| parse_fingerprint(f))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::pinned(trusted))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn trusted_count(&self) -> usize {
        self.trusted.len()
    }

    /// Check the leaf certificate. Always succeeds when pinning is off.
    pub fn verify(&self, leaf_der: &[u8]) -> Result<(), TrustError> {
        if !self.enabled {
            return Ok(());
        }
        if leaf_der.is_empty() {
            return Err(TrustError::NoCertificate);
        }
        let digest = fingerprint(leaf_der);
        if self.trusted.contains(&digest) {
            Ok(())
        } else {
            Err(TrustError::Untrusted {
                fingerprint: hex::encode(digest),
            })
        }
    }
}

/// rustls verifier backed by a [`PinningGate`].
#[derive(Debug)]
pub struct PinningVerifier {
    gate: PinningGate,
    provider: Arc<CryptoProvider>,
    /// Chain validation, used only when pinning is off.
    webpki: Option<Arc<WebPkiServerVerifier>>,
}

impl PinningVerifier {
    /// Build the verifier. Platform roots are loaded only when pinning is
    /// off, since a pinned gate never consults them.
    pub fn new(gate: PinningGate, provider: Arc<CryptoProvider>) -> Result<Self, StartupError> {
        let mut webpki = None;
        if !gate.is_enabled() {
            let roots = native_roots();
            if roots.is_empty() {
                tracing::warn!("No platform trust roots available, HTTPS origins will be rejected");
            } else {
                let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                    .build()
                    .map_err(|e| StartupError::Tls(e.to_string()))?;
                webpki = Some(verifier);
            }
        }
        Ok(Self { gate, provider, webpki })
    }

    pub fn gate(&self) -> &PinningGate {
        &self.gate
    }
}

fn native_roots() -> RootCertStore {
    let loaded = rustls_native_certs::load_native_certs();
    for error in &loaded.errors {
        tracing::warn!(error = %error, "Skipping unreadable platform certificate");
    }
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    tracing::debug!(added, ignored, "Platform trust roots loaded");
    roots
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.gate.is_enabled() {
            return match self.gate.verify(end_entity.as_ref()) {
                Ok(()) => Ok(ServerCertVerified::assertion()),
                Err(e) => {
                    metrics::record_pinning_rejection();
                    tracing::warn!(server = ?server_name, error = %e, "Origin certificate rejected");
                    Err(rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(
                        Arc::new(e),
                    ))))
                }
            };
        }
        match &self.webpki {
            Some(webpki) => webpki.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now),
            None => Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
