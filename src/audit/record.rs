//! Audit record model and its text serialization.
//!
//! A record is a block of `Name: value` lines terminated by CRLF, followed
//! either by an `Error:` line or by the raw header block of the captured
//! message. Bodies are never inlined; the `Body:` line points at the
//! artifact instead.

use chrono::{DateTime, SecondsFormat, Utc};
use http::{request, response, HeaderMap};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Which phase of a transaction a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Request,
    Response,
    /// The origin round trip failed; no response exists.
    TransportError,
}

impl RecordKind {
    /// Value of the `Type:` field. Transport failures are response-phase
    /// records and carry an `Error:` line instead of headers.
    pub fn type_label(self) -> &'static str {
        match self {
            RecordKind::Request => "request",
            RecordKind::Response | RecordKind::TransportError => "response",
        }
    }
}

/// One persisted transaction phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub kind: RecordKind,
    pub timestamp: DateTime<Utc>,
    pub session_id: u64,
    pub peer: SocketAddr,
    pub trace_id: String,
    pub transaction_id: String,
    /// Request or status line plus headers, terminated by a blank line.
    pub header_summary: String,
    /// Artifact the body is captured into. For requests this is decided
    /// before the body is read: a body that never reaches the origin, or
    /// turns out empty, leaves no file behind.
    pub body_artifact: Option<PathBuf>,
    pub transport_error: Option<String>,
}

impl TransactionRecord {
    /// Serialize into the on-disk form, appending to `out`.
    pub fn encode(&self, out: &mut String) {
        let _ = write!(out, "Type: {}\r\n", self.kind.type_label());
        let _ = write!(
            out,
            "ReceivedAt: {}\r\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
        );
        let _ = write!(out, "Session: {}\r\n", self.session_id);
        let _ = write!(out, "From: {}\r\n", self.peer);
        let _ = write!(out, "Trace: {}\r\n", self.trace_id);
        let _ = write!(out, "Transaction: {}\r\n", self.transaction_id);

        match &self.transport_error {
            Some(message) => {
                let _ = write!(out, "Error: {}\r\n\r\n", single_line(message));
            }
            None => {
                if let Some(path) = &self.body_artifact {
                    let _ = write!(out, "Body: {}\r\n", path.display());
                }
                out.push_str("\r\n");
                out.push_str(&self.header_summary);
            }
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity(256 + self.header_summary.len());
        self.encode(&mut out);
        out
    }
}

/// Request line and headers as they appeared on the wire.
pub fn request_header_block(head: &request::Parts) -> String {
    let mut out = format!("{} {} {:?}\r\n", head.method, head.uri, head.version);
    push_headers(&mut out, &head.headers);
    out
}

/// Status line and headers as they appeared on the wire.
pub fn response_header_block(head: &response::Parts) -> String {
    let mut out = format!("{:?} {}\r\n", head.version, head.status);
    push_headers(&mut out, &head.headers);
    out
}

fn push_headers(out: &mut String, headers: &HeaderMap) {
    for (name, value) in headers {
        let _ = write!(out, "{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()));
    }
    out.push_str("\r\n");
}

fn single_line(message: &str) -> String {
    message.replace(['\r', '\n'], " ")
}
