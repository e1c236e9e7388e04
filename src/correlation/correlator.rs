//! Request/response correlation.
//!
//! # Responsibilities
//! - Decide whether a request is captured (debug header, log-all, trace policy)
//! - Mint the transaction identity and park it in the session slot
//! - Turn the matching response (or transport failure) into a record
//! - Hand out body sinks rooted in the transaction's artifact directory

use chrono::Utc;
use http::header::HeaderName;
use http::{request, response, HeaderMap, Uri};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

use super::context::{Completion, SessionSlot, TraceOrigin, TransactionContext};
use crate::audit::record::{request_header_block, response_header_block, RecordKind, TransactionRecord};
use crate::audit::store::{is_valid_segment, ArtifactStore, REQUEST_LEAF, RESPONSE_LEAF};
use crate::audit::AuditHandle;
use crate::capture::ArtifactSink;
use crate::config::schema::CaptureConfig;
use crate::config::validation::ValidationError;
use crate::error::CorrelationError;
use crate::observability::metrics;

/// Trace directory used for requests captured without a trace identity
/// under [`NoTracePolicy::Flag`].
pub const FLAGGED_TRACE_ID: &str = "_untraced";

/// Transport error recorded when the client goes away while the origin
/// round trip is still pending.
pub const CLIENT_DISCONNECTED: &str = "client disconnected before response";

/// What to do with a captured request that carries no usable trace ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoTracePolicy {
    /// Do not capture the transaction.
    #[default]
    Drop,
    /// Capture under a freshly generated trace ID.
    Synthesize,
    /// Capture under [`FLAGGED_TRACE_ID`] and log the omission.
    Flag,
}

/// Parsed capture rules.
#[derive(Debug, Clone)]
pub struct CorrelatorSettings {
    pub trace_header: HeaderName,
    pub debug_header: HeaderName,
    pub log_all: bool,
    pub no_trace: NoTracePolicy,
}

impl CorrelatorSettings {
    pub fn from_config(config: &CaptureConfig) -> Result<Self, ValidationError> {
        let parse = |field: &'static str, value: &str| {
            HeaderName::from_bytes(value.as_bytes())
                .map_err(|e| ValidationError::new(field, format!("invalid header name {value:?}: {e}")))
        };
        Ok(Self {
            trace_header: parse("capture.trace_header", &config.trace_header)?,
            debug_header: parse("capture.debug_header", &config.debug_header)?,
            log_all: config.log_all,
            no_trace: config.no_trace,
        })
    }
}

/// The response-side event delivered by the engine.
#[derive(Debug, Clone, Copy)]
pub enum ResponseOutcome<'a> {
    /// The origin answered. `has_body` tells whether a body will follow.
    Response {
        head: &'a response::Parts,
        has_body: bool,
    },
    /// The round trip to the origin failed before a response arrived.
    TransportError(&'a str),
}

/// Pairs requests with responses and feeds the audit sink.
#[derive(Debug, Clone)]
pub struct Correlator {
    settings: CorrelatorSettings,
    store: ArtifactStore,
    audit: AuditHandle,
}

impl Correlator {
    pub fn new(settings: CorrelatorSettings, store: ArtifactStore, audit: AuditHandle) -> Self {
        Self {
            settings,
            store,
            audit,
        }
    }

    pub fn settings(&self) -> &CorrelatorSettings {
        &self.settings
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Observe a request and, if it is captured, attach a fresh
    /// [`TransactionContext`] to `slot` and queue the request record.
    ///
    /// Returns `Ok(None)` when the request is deliberately not captured.
    ///
    /// The record is written before the body is read, so its `Body:` line
    /// names the `req` artifact whenever `has_body` is set. The file only
    /// exists once the capture has written bytes to it.
    pub fn on_request(
        &self,
        head: &request::Parts,
        peer: SocketAddr,
        has_body: bool,
        slot: &mut SessionSlot,
    ) -> Result<Option<TransactionContext>, CorrelationError> {
        if !matches!(slot, SessionSlot::Empty) {
            metrics::record_correlation_error();
            return Err(CorrelationError::AlreadyObserved);
        }

        if !self.settings.log_all && !head.headers.contains_key(&self.settings.debug_header) {
            *slot = SessionSlot::Skipped;
            return Ok(None);
        }

        let Some((trace_id, origin)) = self.resolve_trace(&head.headers, &head.uri) else {
            *slot = SessionSlot::Skipped;
            return Ok(None);
        };

        let transaction_id = Uuid::new_v4().to_string();
        let dir = self.store.transaction_dir(&trace_id, &transaction_id);
        let ctx = TransactionContext::new(trace_id, origin, transaction_id, peer, dir);

        let record = TransactionRecord {
            kind: RecordKind::Request,
            timestamp: Utc::now(),
            session_id: ctx.session().as_u64(),
            peer,
            trace_id: ctx.trace_id().to_string(),
            transaction_id: ctx.transaction_id().to_string(),
            header_summary: request_header_block(head),
            body_artifact: has_body.then(|| ctx.artifact_path(REQUEST_LEAF)),
            transport_error: None,
        };

        tracing::debug!(
            trace_id = %ctx.trace_id(),
            transaction_id = %ctx.transaction_id(),
            session = %ctx.session(),
            method = %head.method,
            uri = %head.uri,
            "Request observed"
        );

        self.submit(record);
        metrics::record_transaction("request");
        *slot = SessionSlot::Observed(ctx.clone());
        Ok(Some(ctx))
    }

    /// Observe the response (or transport failure) for the transaction in
    /// `slot` and queue its record.
    ///
    /// Returns `Ok(None)` when the request side was not captured.
    pub fn on_response(
        &self,
        outcome: ResponseOutcome<'_>,
        slot: &mut SessionSlot,
    ) -> Result<Option<TransactionRecord>, CorrelationError> {
        let ctx = match std::mem::take(slot) {
            SessionSlot::Observed(ctx) => ctx,
            SessionSlot::Skipped => {
                *slot = SessionSlot::Finalized {
                    transaction_id: None,
                    completion: Completion::Skipped,
                };
                return Ok(None);
            }
            SessionSlot::Empty => {
                metrics::record_correlation_error();
                return Err(CorrelationError::MissingContext);
            }
            SessionSlot::Finalized {
                transaction_id,
                completion,
            } => {
                let err = CorrelationError::AlreadyFinalized {
                    transaction_id: transaction_id.clone().unwrap_or_default(),
                };
                *slot = SessionSlot::Finalized {
                    transaction_id,
                    completion,
                };
                metrics::record_correlation_error();
                return Err(err);
            }
        };

        let (kind, header_summary, body_artifact, transport_error, completion) = match outcome {
            ResponseOutcome::Response { head, has_body } => (
                RecordKind::Response,
                response_header_block(head),
                has_body.then(|| ctx.artifact_path(RESPONSE_LEAF)),
                None,
                Completion::Response,
            ),
            ResponseOutcome::TransportError(message) => (
                RecordKind::TransportError,
                String::new(),
                None,
                Some(message.to_string()),
                Completion::TransportFailed,
            ),
        };

        let record = TransactionRecord {
            kind,
            timestamp: Utc::now(),
            session_id: ctx.session().as_u64(),
            peer: ctx.peer(),
            trace_id: ctx.trace_id().to_string(),
            transaction_id: ctx.transaction_id().to_string(),
            header_summary,
            body_artifact,
            transport_error,
        };

        tracing::debug!(
            transaction_id = %ctx.transaction_id(),
            session = %ctx.session(),
            completion = ?completion,
            "Response observed"
        );

        self.submit(record.clone());
        metrics::record_transaction(match completion {
            Completion::TransportFailed => "transport_error",
            _ => "response",
        });
        *slot = SessionSlot::Finalized {
            transaction_id: Some(ctx.transaction_id().to_string()),
            completion,
        };
        Ok(Some(record))
    }

    /// Sink for the request body of `ctx`.
    pub fn request_sink(&self, ctx: &TransactionContext) -> ArtifactSink {
        ArtifactSink::new(ctx.dir().clone(), REQUEST_LEAF, self.store.flavor())
    }

    /// Sink for the response body of `ctx`.
    pub fn response_sink(&self, ctx: &TransactionContext) -> ArtifactSink {
        ArtifactSink::new(ctx.dir().clone(), RESPONSE_LEAF, self.store.flavor())
    }

    fn resolve_trace(&self, headers: &HeaderMap, uri: &Uri) -> Option<(String, TraceOrigin)> {
        let supplied = headers
            .get(&self.settings.trace_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        if let Some(value) = supplied {
            if is_valid_segment(value) {
                return Some((value.to_string(), TraceOrigin::Header));
            }
            tracing::warn!(
                header = %self.settings.trace_header,
                uri = %uri,
                "Trace ID is not usable as a storage key, treating it as missing"
            );
        }

        match self.settings.no_trace {
            NoTracePolicy::Drop => {
                tracing::info!(
                    header = %self.settings.trace_header,
                    uri = %uri,
                    "Missing trace ID, request not captured"
                );
                None
            }
            NoTracePolicy::Synthesize => Some((Uuid::new_v4().simple().to_string(), TraceOrigin::Synthesized)),
            NoTracePolicy::Flag => {
                tracing::warn!(
                    header = %self.settings.trace_header,
                    uri = %uri,
                    trace_id = FLAGGED_TRACE_ID,
                    "Missing trace ID, capturing under placeholder trace"
                );
                Some((FLAGGED_TRACE_ID.to_string(), TraceOrigin::Flagged))
            }
        }
    }

    fn submit(&self, record: TransactionRecord) {
        if let Err(e) = self.audit.submit(record) {
            tracing::warn!(error = %e, "Audit record dropped");
        }
    }
}

/// Owns the [`SessionSlot`] of one exchange driven by the bundled engine.
///
/// Dropping the guard while the request is observed but unanswered
/// finalizes the transaction with [`CLIENT_DISCONNECTED`], so a cancelled
/// exchange still gets its closing record.
pub struct ExchangeGuard<'a> {
    correlator: &'a Correlator,
    slot: SessionSlot,
}

impl<'a> ExchangeGuard<'a> {
    pub fn new(correlator: &'a Correlator) -> Self {
        Self {
            correlator,
            slot: SessionSlot::default(),
        }
    }

    pub fn on_request(
        &mut self,
        head: &request::Parts,
        peer: SocketAddr,
        has_body: bool,
    ) -> Result<Option<TransactionContext>, CorrelationError> {
        self.correlator.on_request(head, peer, has_body, &mut self.slot)
    }

    pub fn on_response(&mut self, outcome: ResponseOutcome<'_>) -> Result<Option<TransactionRecord>, CorrelationError> {
        self.correlator.on_response(outcome, &mut self.slot)
    }

    pub fn slot(&self) -> &SessionSlot {
        &self.slot
    }
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        let Some(ctx) = self.slot.context() else {
            return;
        };
        tracing::warn!(
            transaction_id = %ctx.transaction_id(),
            peer = %ctx.peer(),
            "Exchange abandoned before the response arrived"
        );
        if let Err(e) = self
            .correlator
            .on_response(ResponseOutcome::TransportError(CLIENT_DISCONNECTED), &mut self.slot)
        {
            tracing::error!(error = %e, "Response correlation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::capture::SinkFlavor;
    use http::{Request, Response, StatusCode};
    use std::collections::HashSet;

    struct Harness {
        _tmp: tempfile::TempDir,
        sink: AuditSink,
        correlator: Correlator,
    }

    async fn harness(log_all: bool, no_trace: NoTracePolicy) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path(), SinkFlavor::Plain);
        let sink = AuditSink::open(store.log_path()).await.unwrap();
        let settings = CorrelatorSettings {
            trace_header: HeaderName::from_static("x-trace-id"),
            debug_header: HeaderName::from_static("x-debug"),
            log_all,
            no_trace,
        };
        let correlator = Correlator::new(settings, store, sink.handle());
        Harness {
            _tmp: tmp,
            sink,
            correlator,
        }
    }

    fn peer() -> SocketAddr {
        "10.0.0.1:40000".parse().unwrap()
    }

    fn request(headers: &[(&str, &str)]) -> request::Parts {
        let mut builder = Request::builder().uri("http://example.com/");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn ok_response() -> response::Parts {
        Response::builder()
            .status(StatusCode::OK)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[tokio::test]
    async fn header_trace_id_pairs_request_and_response() {
        let h = harness(false, NoTracePolicy::Drop).await;
        let mut slot = SessionSlot::default();
        let head = request(&[("x-debug", "1"), ("x-trace-id", "abc123")]);

        let ctx = h.correlator.on_request(&head, peer(), true, &mut slot).unwrap().unwrap();
        assert_eq!(ctx.trace_id(), "abc123");
        assert_eq!(ctx.origin(), TraceOrigin::Header);
        assert!(slot.context().is_some());

        let res = ok_response();
        let record = h
            .correlator
            .on_response(ResponseOutcome::Response { head: &res, has_body: true }, &mut slot)
            .unwrap()
            .unwrap();

        assert_eq!(record.kind, RecordKind::Response);
        assert_eq!(record.session_id, ctx.session().as_u64());
        assert_eq!(record.transaction_id, ctx.transaction_id());
        assert_eq!(record.body_artifact, Some(ctx.artifact_path("res")));
        assert!(slot.is_finalized());
    }

    #[tokio::test]
    async fn requests_without_debug_header_are_skipped_unless_log_all() {
        let h = harness(false, NoTracePolicy::Synthesize).await;
        let mut slot = SessionSlot::default();
        let head = request(&[("x-trace-id", "abc123")]);
        assert!(h.correlator.on_request(&head, peer(), false, &mut slot).unwrap().is_none());
        assert!(matches!(slot, SessionSlot::Skipped));

        let h = harness(true, NoTracePolicy::Synthesize).await;
        let mut slot = SessionSlot::default();
        assert!(h.correlator.on_request(&head, peer(), false, &mut slot).unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_trace_policies() {
        let head = request(&[("x-debug", "1")]);

        let h = harness(false, NoTracePolicy::Drop).await;
        let mut slot = SessionSlot::default();
        assert!(h.correlator.on_request(&head, peer(), false, &mut slot).unwrap().is_none());

        let h = harness(false, NoTracePolicy::Synthesize).await;
        let mut slot = SessionSlot::default();
        let ctx = h.correlator.on_request(&head, peer(), false, &mut slot).unwrap().unwrap();
        assert_eq!(ctx.origin(), TraceOrigin::Synthesized);
        assert!(!ctx.trace_id().is_empty());
        assert_ne!(ctx.trace_id(), ctx.transaction_id());

        let h = harness(false, NoTracePolicy::Flag).await;
        let mut slot = SessionSlot::default();
        let ctx = h.correlator.on_request(&head, peer(), false, &mut slot).unwrap().unwrap();
        assert_eq!(ctx.origin(), TraceOrigin::Flagged);
        assert_eq!(ctx.trace_id(), FLAGGED_TRACE_ID);
    }

    #[tokio::test]
    async fn hostile_trace_ids_are_treated_as_missing() {
        let h = harness(true, NoTracePolicy::Synthesize).await;
        for hostile in ["../../etc", "log", "a/b", ".."] {
            let mut slot = SessionSlot::default();
            let head = request(&[("x-trace-id", hostile)]);
            let ctx = h.correlator.on_request(&head, peer(), false, &mut slot).unwrap().unwrap();
            assert_eq!(ctx.origin(), TraceOrigin::Synthesized);
            assert!(ctx.dir().path().starts_with(h.correlator.store().root()));
        }
    }

    #[tokio::test]
    async fn transaction_ids_never_collide_for_shared_trace() {
        let h = harness(true, NoTracePolicy::Drop).await;
        let head = request(&[("x-trace-id", "same")]);
        let mut ids = HashSet::new();
        for _ in 0..100 {
            let mut slot = SessionSlot::default();
            let ctx = h.correlator.on_request(&head, peer(), false, &mut slot).unwrap().unwrap();
            assert!(ids.insert(ctx.transaction_id().to_string()));
        }
    }

    #[tokio::test]
    async fn transport_error_produces_error_record_without_body() {
        let h = harness(true, NoTracePolicy::Synthesize).await;
        let mut slot = SessionSlot::default();
        h.correlator.on_request(&request(&[]), peer(), false, &mut slot).unwrap();

        let record = h
            .correlator
            .on_response(ResponseOutcome::TransportError("connection refused"), &mut slot)
            .unwrap()
            .unwrap();
        assert_eq!(record.kind, RecordKind::TransportError);
        assert_eq!(record.transport_error.as_deref(), Some("connection refused"));
        assert!(record.body_artifact.is_none());
        assert!(matches!(
            slot,
            SessionSlot::Finalized {
                completion: Completion::TransportFailed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn response_without_context_is_an_error() {
        let h = harness(true, NoTracePolicy::Synthesize).await;
        let mut slot = SessionSlot::default();
        let res = ok_response();
        let err = h
            .correlator
            .on_response(ResponseOutcome::Response { head: &res, has_body: false }, &mut slot)
            .unwrap_err();
        assert_eq!(err, CorrelationError::MissingContext);
    }

    #[tokio::test]
    async fn finalized_transactions_reject_further_events() {
        let h = harness(true, NoTracePolicy::Synthesize).await;
        let mut slot = SessionSlot::default();
        let ctx = h.correlator.on_request(&request(&[]), peer(), false, &mut slot).unwrap().unwrap();
        let res = ok_response();
        let outcome = ResponseOutcome::Response { head: &res, has_body: false };
        h.correlator.on_response(outcome, &mut slot).unwrap();

        let err = h.correlator.on_response(outcome, &mut slot).unwrap_err();
        assert_eq!(
            err,
            CorrelationError::AlreadyFinalized {
                transaction_id: ctx.transaction_id().to_string()
            }
        );
        assert!(slot.is_finalized());

        let err = h.correlator.on_request(&request(&[]), peer(), false, &mut slot).unwrap_err();
        assert_eq!(err, CorrelationError::AlreadyObserved);
    }

    #[tokio::test]
    async fn response_for_skipped_request_is_not_captured() {
        let h = harness(false, NoTracePolicy::Drop).await;
        let mut slot = SessionSlot::default();
        h.correlator.on_request(&request(&[]), peer(), false, &mut slot).unwrap();

        let res = ok_response();
        let record = h
            .correlator
            .on_response(ResponseOutcome::Response { head: &res, has_body: true }, &mut slot)
            .unwrap();
        assert!(record.is_none());
        assert!(matches!(
            slot,
            SessionSlot::Finalized {
                completion: Completion::Skipped,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn log_holds_one_request_and_one_response_per_transaction() {
        let h = harness(true, NoTracePolicy::Synthesize).await;
        let res = ok_response();
        for _ in 0..5 {
            let mut slot = SessionSlot::default();
            h.correlator.on_request(&request(&[]), peer(), false, &mut slot).unwrap();
            h.correlator
                .on_response(ResponseOutcome::Response { head: &res, has_body: false }, &mut slot)
                .unwrap();
        }
        let log_path = h.correlator.store().log_path();
        h.sink.close().await.unwrap();

        let log = std::fs::read_to_string(log_path).unwrap();
        let mut kinds: std::collections::HashMap<String, Vec<String>> = Default::default();
        let mut current_kind = String::new();
        for line in log.lines() {
            if let Some(kind) = line.strip_prefix("Type: ") {
                current_kind = kind.to_string();
            }
            if let Some(tx) = line.strip_prefix("Transaction: ") {
                kinds.entry(tx.to_string()).or_default().push(current_kind.clone());
            }
        }
        assert_eq!(kinds.len(), 5);
        for phases in kinds.values() {
            assert_eq!(phases, &vec!["request".to_string(), "response".to_string()]);
        }
    }

    #[tokio::test]
    async fn abandoned_exchange_is_finalized_with_transport_error() {
        let h = harness(true, NoTracePolicy::Synthesize).await;
        let mut guard = ExchangeGuard::new(&h.correlator);
        let ctx = guard.on_request(&request(&[]), peer(), false).unwrap().unwrap();
        drop(guard);

        let log_path = h.correlator.store().log_path();
        h.sink.close().await.unwrap();
        let log = std::fs::read_to_string(log_path).unwrap();
        assert_eq!(log.matches(&format!("Transaction: {}", ctx.transaction_id())).count(), 2);
        assert!(log.contains(&format!("Error: {CLIENT_DISCONNECTED}\r\n")));
    }

    #[tokio::test]
    async fn completed_exchange_adds_nothing_on_drop() {
        let h = harness(true, NoTracePolicy::Synthesize).await;
        let res = ok_response();
        let mut guard = ExchangeGuard::new(&h.correlator);
        guard.on_request(&request(&[]), peer(), false).unwrap();
        guard
            .on_response(ResponseOutcome::Response { head: &res, has_body: false })
            .unwrap();
        assert!(guard.slot().is_finalized());
        drop(guard);

        // A skipped exchange has nothing to finalize either.
        let skipped = harness(false, NoTracePolicy::Drop).await;
        drop({
            let mut guard = ExchangeGuard::new(&skipped.correlator);
            guard.on_request(&request(&[]), peer(), false).unwrap();
            guard
        });

        let log_path = h.correlator.store().log_path();
        h.sink.close().await.unwrap();
        let log = std::fs::read_to_string(log_path).unwrap();
        assert_eq!(log.matches("Type: ").count(), 2);
        assert!(!log.contains("Error: "));
    }

    #[tokio::test]
    async fn request_record_names_body_artifact_before_it_exists() {
        let h = harness(true, NoTracePolicy::Synthesize).await;
        let mut slot = SessionSlot::default();
        let ctx = h.correlator.on_request(&request(&[]), peer(), true, &mut slot).unwrap().unwrap();

        let log_path = h.correlator.store().log_path();
        h.sink.close().await.unwrap();
        let log = std::fs::read_to_string(log_path).unwrap();
        let req = ctx.artifact_path(REQUEST_LEAF);
        assert!(log.contains(&format!("Body: {}\r\n", req.display())));
        assert!(!req.exists());
    }
}
