//! Response capture for the first execution of a key.
//!
//! The downstream response is streamed to the client frame by frame while a
//! copy is buffered. Once the stream ends the copy is stored for replay, or
//! the slot is released when the copy is unusable.

use crate::downstream::HandlerBody;
use crate::metrics_defs::{CLEAR, COMPLETE};
use crate::slot::{CapturedResponse, select_captured_headers};
use crate::store::IdemStore;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Frame, SizeHint};
use shared::counter;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

type SettleFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Why a processing slot is deleted instead of completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    ClientError,
    ServerError,
    OtherStatus,
    Poisoned,
}

impl ClearReason {
    pub fn from_status(status: StatusCode) -> ClearReason {
        if status.is_client_error() {
            ClearReason::ClientError
        } else if status.is_server_error() {
            ClearReason::ServerError
        } else {
            ClearReason::OtherStatus
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClearReason::ClientError => "client_error",
            ClearReason::ServerError => "server_error",
            ClearReason::OtherStatus => "other_status",
            ClearReason::Poisoned => "poisoned",
        }
    }
}

pub enum Outcome {
    Complete(CapturedResponse),
    Clear(ClearReason),
}

/// Applies the outcome of a first execution to the store. Store failures are
/// logged and counted; the client has already been answered.
pub async fn settle(store: IdemStore, key: String, outcome: Outcome) {
    match outcome {
        Outcome::Complete(response) => match store.complete(&key, &response).await {
            Ok(true) => {
                counter!(COMPLETE, "result" => "stored").increment(1);
                tracing::debug!(key = %key, status = response.status.as_u16(), "response stored");
            }
            Ok(false) => {
                counter!(COMPLETE, "result" => "skipped").increment(1);
                tracing::warn!(key = %key, "processing slot expired before completion");
            }
            Err(error) => {
                counter!(COMPLETE, "result" => "error").increment(1);
                tracing::warn!(key = %key, error = %error, "failed to store response");
            }
        },
        Outcome::Clear(reason) => {
            counter!(CLEAR, "reason" => reason.as_str()).increment(1);
            if let Err(error) = store.clear(&key).await {
                tracing::warn!(key = %key, reason = reason.as_str(), error = %error, "failed to clear slot");
            }
        }
    }
}

enum Buffer {
    Collecting(Vec<u8>),
    Poisoned,
}

/// Status, replayable headers and a bounded copy of the body.
pub struct Capture {
    store: IdemStore,
    key: String,
    status: StatusCode,
    headers: HeaderMap,
    content_length: Option<u64>,
    buffer: Buffer,
    limit: usize,
}

impl Capture {
    pub fn new(
        store: IdemStore,
        key: String,
        status: StatusCode,
        headers: &HeaderMap,
        limit: usize,
    ) -> Self {
        Capture {
            store,
            key,
            status,
            headers: select_captured_headers(headers),
            content_length: headers
                .get(CONTENT_LENGTH)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok()),
            buffer: Buffer::Collecting(Vec::new()),
            limit,
        }
    }

    fn push(&mut self, data: &Bytes) {
        if let Buffer::Collecting(buffer) = &mut self.buffer {
            if buffer.len() + data.len() > self.limit {
                self.poison("capture limit exceeded");
            } else {
                buffer.extend_from_slice(data);
            }
        }
    }

    fn poison(&mut self, reason: &'static str) {
        if matches!(self.buffer, Buffer::Collecting(_)) {
            tracing::warn!(key = %self.key, reason, limit = self.limit, "response capture poisoned");
            self.buffer = Buffer::Poisoned;
        }
    }

    /// Stores the buffered copy, or releases the slot if it was poisoned.
    pub async fn finish(self) {
        let outcome = match self.buffer {
            Buffer::Collecting(body) => Outcome::Complete(CapturedResponse {
                status: self.status,
                headers: self.headers,
                body: Bytes::from(body),
            }),
            Buffer::Poisoned => Outcome::Clear(ClearReason::Poisoned),
        };
        settle(self.store, self.key, outcome).await
    }
}

/// Body wrapper that forwards every frame and feeds data frames to a
/// [`Capture`].
///
/// The last data frame is held back until the outcome has been applied, so a
/// client that sees the full response can rely on a retry being replayed.
/// HTTP/1 stops polling a body once its announced length has been written,
/// which is why the last frame is recognised by length as well as by the
/// inner body reporting its end.
/// If the body is dropped early the rest of the downstream body is drained
/// in the background, bounded by the processing TTL.
pub struct CaptureBody {
    inner: HandlerBody,
    capture: Option<Capture>,
    settling: Option<SettleFuture>,
    held: Option<Frame<Bytes>>,
    expected_len: Option<u64>,
    seen: u64,
    done: bool,
}

impl CaptureBody {
    pub fn new(inner: HandlerBody, capture: Capture) -> Self {
        let expected_len = capture.content_length.or(inner.size_hint().exact());
        CaptureBody {
            inner,
            capture: Some(capture),
            settling: None,
            held: None,
            expected_len,
            seen: 0,
            done: false,
        }
    }

    /// Applies the outcome right away when the body is known to be empty.
    /// HTTP/1 never polls such a body, so it would otherwise only settle when
    /// dropped.
    pub async fn settle_if_empty(mut self) -> Self {
        if self.inner.is_end_stream() || self.expected_len == Some(0) {
            if let Some(capture) = self.capture.take() {
                capture.finish().await;
            }
        }
        self
    }

    fn is_last_frame(&self) -> bool {
        self.inner.is_end_stream() || self.expected_len.is_some_and(|len| self.seen >= len)
    }
}

impl Body for CaptureBody {
    type Data = Bytes;
    type Error = crate::errors::GatewayError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            if let Some(settling) = this.settling.as_mut() {
                ready!(settling.as_mut().poll(cx));
                this.settling = None;
                this.done = true;
                if let Some(frame) = this.held.take() {
                    return Poll::Ready(Some(Ok(frame)));
                }
            }
            if this.done {
                return Poll::Ready(None);
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        this.seen += data.len() as u64;
                        if let Some(capture) = this.capture.as_mut() {
                            capture.push(data);
                        }
                    }
                    if this.is_last_frame() {
                        if let Some(capture) = this.capture.take() {
                            this.settling = Some(Box::pin(capture.finish()));
                            this.held = Some(frame);
                            continue;
                        }
                    }
                    return Poll::Ready(Some(Ok(frame)));
                }
                Some(Err(error)) => {
                    if let Some(mut capture) = this.capture.take() {
                        capture.poison("downstream body error");
                        spawn_detached(Box::pin(capture.finish()));
                    }
                    this.done = true;
                    return Poll::Ready(Some(Err(error)));
                }
                None => match this.capture.take() {
                    Some(capture) => this.settling = Some(Box::pin(capture.finish())),
                    None => this.done = true,
                },
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CaptureBody {
    fn drop(&mut self) {
        if let Some(settling) = self.settling.take() {
            spawn_detached(settling);
            return;
        }
        let Some(capture) = self.capture.take() else {
            return;
        };
        let empty: HandlerBody = Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed_unsync();
        let inner = std::mem::replace(&mut self.inner, empty);
        spawn_detached(Box::pin(drain(inner, capture)));
    }
}

async fn drain(mut body: HandlerBody, mut capture: Capture) {
    tracing::debug!(key = %capture.key, "client went away, draining downstream body");
    let deadline = capture.store.ttls().processing;
    let drained = tokio::time::timeout(deadline, async {
        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    if let Some(data) = frame.data_ref() {
                        capture.push(data);
                    }
                }
                Err(_) => {
                    capture.poison("downstream body error");
                    break;
                }
            }
        }
    })
    .await;
    if drained.is_err() {
        capture.poison("downstream body did not finish");
    }
    capture.finish().await;
}

fn spawn_detached(fut: SettleFuture) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
        }
        Err(_) => tracing::error!("no runtime to settle idempotency slot, it will expire"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::errors::GatewayError;
    use crate::slot::Slot;
    use crate::testutils::{ChannelBody, ChunkedBody, wait_until};
    use crate::ttl::Ttls;
    use http::header::{CONTENT_TYPE, HeaderValue};
    use std::sync::Arc;
    use std::time::Duration;

    async fn acquired(key: &str) -> (Arc<MemoryEngine>, IdemStore) {
        let engine = Arc::new(MemoryEngine::new());
        let store = IdemStore::new(
            engine.clone(),
            "idem:",
            Ttls::default(),
            Duration::from_millis(500),
        );
        store.acquire(key, "h").await.unwrap();
        (engine, store)
    }

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));
        headers
    }

    fn stored(engine: &MemoryEngine, key: &str) -> Option<CapturedResponse> {
        let raw = engine.get(&format!("idem:{key}"))?;
        Slot::decode(&raw).unwrap().into_response().ok()
    }

    #[test]
    fn test_clear_reason_from_status() {
        assert_eq!(
            ClearReason::from_status(StatusCode::BAD_REQUEST),
            ClearReason::ClientError
        );
        assert_eq!(
            ClearReason::from_status(StatusCode::BAD_GATEWAY),
            ClearReason::ServerError
        );
        assert_eq!(
            ClearReason::from_status(StatusCode::FOUND),
            ClearReason::OtherStatus
        );
    }

    #[tokio::test]
    async fn test_frames_forwarded_and_stored() {
        let (engine, store) = acquired("k1").await;
        let capture = Capture::new(store, "k1".into(), StatusCode::OK, &json_headers(), 1024);
        let inner = ChunkedBody::new(["{\"ok\"", ":true}"]).boxed_unsync();
        let mut body = CaptureBody::new(inner, capture);

        let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(first.as_ref(), b"{\"ok\"");
        let second = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(second.as_ref(), b":true}");
        assert!(body.frame().await.is_none());
        assert!(body.is_end_stream());

        // Completed before the end of stream was reported.
        let response = stored(&engine, "k1").unwrap();
        assert_eq!(response.body.as_ref(), b"{\"ok\":true}");
        assert_eq!(response.headers.len(), 1);
        assert_eq!(response.headers[CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn test_capture_limit_poisons_and_clears() {
        let (engine, store) = acquired("k1").await;
        let capture = Capture::new(store, "k1".into(), StatusCode::OK, &json_headers(), 4);
        let inner = ChunkedBody::new(["abc", "def"]).boxed_unsync();
        let body = CaptureBody::new(inner, capture);

        // The client still receives the whole body.
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected.as_ref(), b"abcdef");
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_body_error_clears_slot() {
        let (engine, store) = acquired("k1").await;
        let capture = Capture::new(store, "k1".into(), StatusCode::OK, &json_headers(), 1024);
        let inner = ChunkedBody::from_results(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(GatewayError::ResponseBodyError("reset".into())),
        ])
        .boxed_unsync();
        let body = CaptureBody::new(inner, capture);

        assert!(body.collect().await.is_err());
        wait_until(|| engine.is_empty()).await;
    }

    #[tokio::test]
    async fn test_dropped_body_is_drained() {
        let (engine, store) = acquired("k1").await;
        let capture = Capture::new(store, "k1".into(), StatusCode::CREATED, &json_headers(), 1024);
        let (tx, inner) = ChannelBody::new();
        let mut body = CaptureBody::new(inner.boxed_unsync(), capture);

        tx.send(Bytes::from_static(b"part1,")).await.unwrap();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap().as_ref(), b"part1,");

        drop(body);
        tx.send(Bytes::from_static(b"part2")).await.unwrap();
        drop(tx);

        wait_until(|| stored(&engine, "k1").is_some()).await;
        let response = stored(&engine, "k1").unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.body.as_ref(), b"part1,part2");
    }

    #[tokio::test]
    async fn test_last_frame_waits_for_completion() {
        let (engine, store) = acquired("k1").await;
        let capture = Capture::new(store, "k1".into(), StatusCode::OK, &json_headers(), 1024);
        let inner: HandlerBody = http_body_util::Full::new(Bytes::from_static(b"{\"ok\":true}"))
            .map_err(|never| match never {})
            .boxed_unsync();
        let mut body = CaptureBody::new(inner, capture);

        // The frame that completes the body is only released once stored,
        // without waiting for the caller to poll for the end of stream.
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap().as_ref(), b"{\"ok\":true}");
        assert!(body.is_end_stream());
        assert!(stored(&engine, "k1").is_some());
    }

    #[tokio::test]
    async fn test_content_length_marks_last_frame() {
        let (engine, store) = acquired("k1").await;
        let mut headers = json_headers();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("6"));
        let capture = Capture::new(store, "k1".into(), StatusCode::OK, &headers, 1024);
        let inner = ChunkedBody::new(["abc", "def"]).boxed_unsync();
        let mut body = CaptureBody::new(inner, capture);

        body.frame().await.unwrap().unwrap();
        assert!(stored(&engine, "k1").is_none());
        body.frame().await.unwrap().unwrap();
        assert!(body.is_end_stream());
        assert_eq!(stored(&engine, "k1").unwrap().body.as_ref(), b"abcdef");
    }

    #[tokio::test]
    async fn test_empty_body_settles_before_polling() {
        let (engine, store) = acquired("k1").await;
        let capture = Capture::new(store, "k1".into(), StatusCode::OK, &HeaderMap::new(), 1024);
        let inner: HandlerBody = Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed_unsync();
        let body = CaptureBody::new(inner, capture).settle_if_empty().await;

        assert_eq!(stored(&engine, "k1").unwrap().body.len(), 0);
        drop(body);
    }

    #[tokio::test]
    async fn test_size_hint_is_forwarded() {
        let (_, store) = acquired("k1").await;
        let capture = Capture::new(store, "k1".into(), StatusCode::OK, &HeaderMap::new(), 1024);
        let inner: HandlerBody = http_body_util::Full::new(Bytes::from_static(b"12345"))
            .map_err(|never| match never {})
            .boxed_unsync();
        let body = CaptureBody::new(inner, capture);
        assert_eq!(body.size_hint().exact(), Some(5));
    }
}
