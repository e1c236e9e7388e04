//! HTTP server setup and the proxy handler.
//!
//! # Responsibilities
//! - Create Axum Router with the forwarding handler as fallback
//! - Serve from the shutdown-aware listener with graceful shutdown
//! - Call the correlator's request and response hooks
//! - Tee captured request and response bodies into artifacts
//! - Forward requests to the origin

use axum::{
    body::Body,
    extract::{connect_info::Connected, ConnectInfo, State},
    http::{Method, Request, StatusCode},
    response::{IntoResponse, Response},
    serve::IncomingStream,
    Router,
};
use bytes::Bytes;
use http_body::Body as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;

use super::client::UpstreamClient;
use super::request::{strip_hop_by_hop, upstream_uri};
use super::response::UpstreamFailure;
use crate::capture::{ArtifactSink, CaptureBody};
use crate::correlation::{Correlator, ExchangeGuard, ResponseOutcome, TransactionContext};
use crate::net::{Acceptor, ShutdownHandle, TrackedListener};

/// Address of the client on the other end of a proxied connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo(pub SocketAddr);

impl<A: Acceptor> Connected<IncomingStream<'_, TrackedListener<A>>> for PeerInfo {
    fn connect_info(stream: IncomingStream<'_, TrackedListener<A>>) -> Self {
        PeerInfo(*stream.remote_addr())
    }
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub correlator: Arc<Correlator>,
    pub client: UpstreamClient,
    pub request_timeout: Duration,
    /// Body captures still closing; shutdown waits on it.
    pub captures: TaskTracker,
}

/// HTTP server for the audit proxy.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(state: AppState) -> Self {
        Self {
            router: Self::build_router(state),
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` fires, then wait for in-flight connections.
    pub async fn run<A: Acceptor>(self, listener: TrackedListener<A>, shutdown: ShutdownHandle) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<PeerInfo>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.stopped())
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Forward one proxied request, recording it when the capture rules say so.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(PeerInfo(peer)): ConnectInfo<PeerInfo>,
    request: Request<Body>,
) -> Response {
    if request.method() == Method::CONNECT {
        tracing::debug!(peer = %peer, target = %request.uri(), "CONNECT tunnel refused");
        return (StatusCode::NOT_IMPLEMENTED, "CONNECT tunnels are not supported").into_response();
    }

    let (mut parts, body) = request.into_parts();
    let target = match upstream_uri(&parts.uri) {
        Ok(uri) => uri,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "Rejected non-proxy request");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let correlator = &state.correlator;
    let mut exchange = ExchangeGuard::new(correlator);
    let has_body = !body.is_end_stream();
    let ctx = match exchange.on_request(&parts, peer, has_body) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(peer = %peer, uri = %parts.uri, error = %e, "Request correlation failed");
            None
        }
    };

    let body = match &ctx {
        Some(ctx) if has_body => capture(body, correlator.request_sink(ctx), ctx, &state.captures),
        _ => body,
    };

    strip_hop_by_hop(&mut parts.headers);
    parts.uri = target;
    let upstream = Request::from_parts(parts, body);

    let forwarded = tokio::time::timeout(state.request_timeout, state.client.request(upstream)).await;
    let result: Result<hyper::Response<hyper::body::Incoming>, UpstreamFailure> = match forwarded {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(UpstreamFailure::Transport(e)),
        Err(_) => Err(UpstreamFailure::Timeout(state.request_timeout)),
    };

    match result {
        Ok(response) => {
            let (mut head, body) = response.into_parts();
            let has_body = !body.is_end_stream();
            if let Err(e) = exchange.on_response(ResponseOutcome::Response { head: &head, has_body }) {
                tracing::error!(peer = %peer, error = %e, "Response correlation failed");
            }

            strip_hop_by_hop(&mut head.headers);
            let body = match &ctx {
                Some(ctx) if has_body => capture(body, correlator.response_sink(ctx), ctx, &state.captures),
                _ => Body::new(body),
            };
            Response::from_parts(head, body)
        }
        Err(failure) => {
            let message = failure.message();
            tracing::warn!(
                peer = %peer,
                transaction_id = ctx.as_ref().map(TransactionContext::transaction_id),
                error = %message,
                "Upstream request failed"
            );
            if let Err(e) = exchange.on_response(ResponseOutcome::TransportError(&message)) {
                tracing::error!(peer = %peer, error = %e, "Response correlation failed");
            }
            failure.into_response()
        }
    }
}

/// Wrap `body` so its bytes land in `sink`, logging the outcome when the
/// capture closes.
fn capture<B>(body: B, sink: ArtifactSink, ctx: &TransactionContext, captures: &TaskTracker) -> Body
where
    B: http_body::Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<axum::BoxError>,
{
    let (body, handle) = CaptureBody::new(body, sink, captures);
    let transaction_id = ctx.transaction_id().to_string();
    captures.spawn(async move {
        match handle.outcome().await {
            Ok(summary) => tracing::debug!(
                transaction_id = %transaction_id,
                artifact = %summary.path.display(),
                bytes = summary.bytes,
                "Body captured"
            ),
            Err(e) => tracing::warn!(transaction_id = %transaction_id, error = %e, "Body capture failed"),
        }
    });
    Body::new(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{ArtifactStore, AuditSink};
    use crate::capture::SinkFlavor;
    use crate::config::{CaptureConfig, TimeoutConfig};
    use crate::correlation::CorrelatorSettings;
    use crate::http::build_client;
    use crate::security::PinningGate;
    use axum::extract::connect_info::MockConnectInfo;
    use tower::ServiceExt;

    async fn app(storage: &std::path::Path) -> (Router, AuditSink) {
        let store = ArtifactStore::new(storage, SinkFlavor::Plain);
        let audit = AuditSink::open(store.log_path()).await.unwrap();
        let settings = CorrelatorSettings::from_config(&CaptureConfig {
            log_all: true,
            ..CaptureConfig::default()
        })
        .unwrap();
        let state = AppState {
            correlator: Arc::new(Correlator::new(settings, store, audit.handle())),
            client: build_client(PinningGate::disabled(), &TimeoutConfig::default()).unwrap(),
            request_timeout: Duration::from_secs(5),
            captures: TaskTracker::new(),
        };
        let peer = PeerInfo("127.0.0.1:50000".parse().unwrap());
        (HttpServer::build_router(state).layer(MockConnectInfo(peer)), audit)
    }

    #[tokio::test]
    async fn connect_is_not_implemented() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, audit) = app(tmp.path()).await;

        let request = Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);

        audit.close().await.unwrap();
        assert_eq!(std::fs::read_to_string(tmp.path().join("log")).unwrap(), "");
    }

    #[tokio::test]
    async fn origin_form_target_is_a_bad_request() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, audit) = app(tmp.path()).await;

        let request = Request::builder().uri("/no-authority").body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        audit.close().await.unwrap();
        assert_eq!(std::fs::read_to_string(tmp.path().join("log")).unwrap(), "");
    }
}
