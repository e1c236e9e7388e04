//! Response handling for the client hop.
//!
//! # Responsibilities
//! - Map upstream failures to appropriate HTTP status codes
//! - Render a transport error as a single readable message
//!
//! # Design Decisions
//! - Backend timeouts result in 504 Gateway Timeout
//! - Any other upstream failure results in 502 Bad Gateway

use axum::response::{IntoResponse, Response};
use http::StatusCode;
use std::error::Error as StdError;
use std::time::Duration;

/// Why the upstream round trip produced no response.
#[derive(Debug)]
pub enum UpstreamFailure {
    Timeout(Duration),
    Transport(hyper_util::client::legacy::Error),
}

impl UpstreamFailure {
    /// Message recorded in the audit log and returned to the client.
    pub fn message(&self) -> String {
        match self {
            Self::Timeout(after) => format!("upstream did not respond within {}s", after.as_secs()),
            Self::Transport(e) => error_chain(e),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for UpstreamFailure {
    fn into_response(self) -> Response {
        (self.status(), self.message()).into_response()
    }
}

/// `outer: inner: innermost`, skipping repeated messages.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts: Vec<String> = vec![err.to_string()];
    let mut source = err.source();
    while let Some(e) = source {
        let text = e.to_string();
        if parts.last() != Some(&text) {
            parts.push(text);
        }
        source = e.source();
    }
    parts.join(": ")
}
