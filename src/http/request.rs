//! Request preparation for the upstream hop.
//!
//! # Responsibilities
//! - Validate the proxied target (absolute-form `http`/`https` only)
//! - Strip hop-by-hop headers before forwarding
//!
//! # Design Decisions
//! - Headers named by `Connection` are hop-by-hop too
//! - The audit record is taken before stripping, so it shows what the
//!   client actually sent

use http::header::{self, HeaderMap, HeaderName};
use http::uri::Scheme;
use http::Uri;
use thiserror::Error;

/// Headers that apply to a single connection and are never forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("request target must be an absolute http:// or https:// URI, got {0}")]
    NotAbsolute(String),

    #[error("unsupported scheme {0}")]
    UnsupportedScheme(String),
}

/// The upstream URI for a proxied request.
pub fn upstream_uri(uri: &Uri) -> Result<Uri, TargetError> {
    let (Some(scheme), Some(_)) = (uri.scheme(), uri.authority()) else {
        return Err(TargetError::NotAbsolute(uri.to_string()));
    };
    if *scheme != Scheme::HTTP && *scheme != Scheme::HTTPS {
        return Err(TargetError::UnsupportedScheme(scheme.to_string()));
    }
    Ok(uri.clone())
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
