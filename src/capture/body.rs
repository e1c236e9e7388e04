//! Body wrapper that tees data frames into an artifact sink.
//!
//! Each data frame is written to the sink before it is handed to the
//! consumer, so a slow disk slows the proxied body down with it. Sink
//! failures never reach the data path: the first one is kept and reported
//! through the [`CaptureHandle`] when the capture closes.
//!
//! The sink is closed before the last frame is yielded whenever the inner
//! body already reports end of stream, since hyper stops polling a
//! sized body after its final byte. A body dropped mid-stream closes its
//! sink on a task registered with the capture [`TaskTracker`], which
//! shutdown waits on.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body::{Body, Frame, SizeHint};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;

use super::sink::ArtifactSink;
use crate::error::CaptureError;
use crate::observability::metrics;

/// Result of a finished capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSummary {
    pub path: PathBuf,
    pub bytes: u64,
}

type Outcome = Result<CaptureSummary, CaptureError>;

/// Receives the outcome of a capture once its sink has been closed.
#[derive(Debug)]
pub struct CaptureHandle {
    rx: oneshot::Receiver<Outcome>,
}

impl CaptureHandle {
    /// Wait for the capture to close.
    pub async fn outcome(self) -> Outcome {
        self.rx.await.unwrap_or(Err(CaptureError::Abandoned))
    }
}

enum State {
    Idle(ArtifactSink),
    Writing(BoxFuture<'static, (ArtifactSink, Result<(), CaptureError>)>),
    Closing(BoxFuture<'static, Result<u64, CaptureError>>),
    Done,
}

/// An [`http_body::Body`] that forwards `inner` unchanged while copying
/// its data into an [`ArtifactSink`].
pub struct CaptureBody<B> {
    inner: B,
    state: State,
    /// Frame held back until its write has completed.
    pending: Option<Frame<Bytes>>,
    failure: Option<CaptureError>,
    path: PathBuf,
    leaf: &'static str,
    done: Option<oneshot::Sender<Outcome>>,
    tracker: TaskTracker,
}

impl<B> CaptureBody<B> {
    pub fn new(inner: B, sink: ArtifactSink, tracker: &TaskTracker) -> (Self, CaptureHandle) {
        let (tx, rx) = oneshot::channel();
        let body = Self {
            inner,
            path: sink.path().to_path_buf(),
            leaf: sink.leaf(),
            state: State::Idle(sink),
            pending: None,
            failure: None,
            done: Some(tx),
            tracker: tracker.clone(),
        };
        (body, CaptureHandle { rx })
    }

    fn record_failure(&mut self, err: CaptureError) {
        tracing::warn!(
            artifact = %self.path.display(),
            error = %err,
            "Artifact write failed, capture stopped"
        );
        self.failure.get_or_insert(err);
    }

    /// Start closing the sink, holding `last` back until the close is done.
    fn begin_close(&mut self, last: Option<Frame<Bytes>>) {
        self.pending = last;
        if let State::Idle(sink) = std::mem::replace(&mut self.state, State::Done) {
            self.state = State::Closing(Box::pin(sink.close()));
        }
    }
}

impl<B> Body for CaptureBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                State::Writing(write) => {
                    let (sink, result) = ready!(write.as_mut().poll(cx));
                    this.state = State::Idle(sink);
                    if let Err(err) = result {
                        this.record_failure(err);
                    }
                    if let Some(frame) = this.pending.take() {
                        if this.inner.is_end_stream() {
                            this.begin_close(Some(frame));
                            continue;
                        }
                        return Poll::Ready(Some(Ok(frame)));
                    }
                    continue;
                }
                State::Closing(close) => {
                    let closed = ready!(close.as_mut().poll(cx));
                    this.state = State::Done;
                    let outcome = settle(this.path.clone(), this.leaf, this.failure.take(), closed);
                    deliver(this.done.take(), outcome);
                    return Poll::Ready(this.pending.take().map(Ok));
                }
                State::Done => return Poll::Ready(this.pending.take().map(Ok)),
                State::Idle(_) => {}
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    let data = match frame.data_ref() {
                        Some(data) if !data.is_empty() && this.failure.is_none() => data.clone(),
                        _ if this.inner.is_end_stream() => {
                            this.begin_close(Some(frame));
                            continue;
                        }
                        _ => return Poll::Ready(Some(Ok(frame))),
                    };
                    let State::Idle(mut sink) = std::mem::replace(&mut this.state, State::Done) else {
                        return Poll::Ready(Some(Ok(frame)));
                    };
                    this.pending = Some(frame);
                    this.state = State::Writing(Box::pin(async move {
                        let result = sink.write(&data).await;
                        (sink, result)
                    }));
                }
                Some(Err(err)) => return Poll::Ready(Some(Err(err))),
                None => this.begin_close(None),
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.state, State::Done) && self.pending.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for CaptureBody<B> {
    fn drop(&mut self) {
        let Some(done) = self.done.take() else {
            return;
        };
        let state = std::mem::replace(&mut self.state, State::Done);
        let failure = self.failure.take();
        let path = self.path.clone();
        let leaf = self.leaf;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            deliver(Some(done), Err(CaptureError::Abandoned));
            return;
        };

        tracing::debug!(artifact = %path.display(), "Body dropped before end of stream, closing artifact");
        runtime.spawn(self.tracker.track_future(async move {
            let (failure, closed) = match state {
                State::Idle(sink) => (failure, sink.close().await),
                State::Writing(write) => {
                    let (sink, result) = write.await;
                    (failure.or(result.err()), sink.close().await)
                }
                State::Closing(close) => (failure, close.await),
                State::Done => (failure, Err(CaptureError::Abandoned)),
            };
            deliver(Some(done), settle(path, leaf, failure, closed));
        }));
    }
}

/// Combine a mid-stream failure with the close result. The mid-stream
/// failure wins so it is reported exactly once.
fn settle(
    path: PathBuf,
    leaf: &'static str,
    failure: Option<CaptureError>,
    closed: Result<u64, CaptureError>,
) -> Outcome {
    if let Some(err) = failure {
        return Err(err);
    }
    let bytes = closed?;
    metrics::record_capture_bytes(leaf, bytes);
    Ok(CaptureSummary { path, bytes })
}

fn deliver(done: Option<oneshot::Sender<Outcome>>, outcome: Outcome) {
    match &outcome {
        Ok(summary) => tracing::debug!(
            artifact = %summary.path.display(),
            bytes = summary.bytes,
            "Artifact closed"
        ),
        Err(err) => tracing::warn!(error = %err, "Artifact capture failed"),
    }
    if let Some(done) = done {
        let _ = done.send(outcome);
    }
}
