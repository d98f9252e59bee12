use crate::capture::{Capture, CaptureBody, ClearReason, Outcome, settle};
use crate::config::{FailureMode, IdempotencyConfig};
use crate::downstream::{Downstream, HandlerBody, boxed, envelope_response};
use crate::errors::GatewayError;
use crate::key::{derive_key, fingerprint};
use crate::metrics_defs::{ACQUIRE, BYPASS};
use crate::store::{AcquireState, IdemStore};
use http::header::{HeaderValue, RETRY_AFTER};
use http::request::Parts;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::{Method, Request, Response, StatusCode};
use shared::counter;
use std::error::Error as StdError;
use std::sync::Arc;


pub const IN_FLIGHT_MESSAGE: &str = "Duplicate request in progress. Please retry.";
pub const MISMATCH_MESSAGE: &str = "Request body mismatch for same Idempotency-Key";

#[derive(Clone, Debug, PartialEq)]
pub struct GatewaySettings {
    pub failure_mode: FailureMode,
    pub require_key: bool,
    pub max_body_bytes: usize,
    pub capture_limit_bytes: usize,
    pub retry_after_secs: u64,
}

impl From<&IdempotencyConfig> for GatewaySettings {
    fn from(config: &IdempotencyConfig) -> Self {
        GatewaySettings {
            failure_mode: config.failure_mode,
            require_key: config.require_key,
            max_body_bytes: config.max_body_bytes,
            capture_limit_bytes: config.capture_limit_bytes,
            retry_after_secs: config.retry_after_secs,
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings::from(&IdempotencyConfig::default())
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::DELETE)
}

/// Runs each mutating request at most once per idempotency key and replays
/// the stored response to later duplicates.
pub struct Gateway {
    store: IdemStore,
    downstream: Arc<dyn Downstream>,
    settings: GatewaySettings,
}

impl Gateway {
    pub fn new(store: IdemStore, downstream: Arc<dyn Downstream>, settings: GatewaySettings) -> Self {
        Gateway {
            store,
            downstream,
            settings,
        }
    }

    pub fn store(&self) -> &IdemStore {
        &self.store
    }

    /// Traffic can be served unless the store is down and requests would be
    /// refused because of it.
    pub fn is_ready(&self) -> bool {
        self.settings.failure_mode == FailureMode::FailOpen || self.store.is_healthy()
    }

    pub async fn handle<B>(&self, request: Request<B>) -> Response<HandlerBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        if !is_mutating(request.method()) {
            let request = request.map(|body| {
                body.map_err(|e| {
                    let e: Box<dyn StdError + Send + Sync> = e.into();
                    GatewayError::RequestBodyError(e.to_string())
                })
                .boxed_unsync()
            });
            return self.downstream.call(request).await;
        }

        let (parts, body) = request.into_parts();
        let body = match Limited::new(body, self.settings.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(error) if error.downcast_ref::<LengthLimitError>().is_some() => {
                let error = GatewayError::BodyTooLarge {
                    limit: self.settings.max_body_bytes,
                };
                tracing::debug!(error = %error, "rejecting request");
                return envelope_response(StatusCode::PAYLOAD_TOO_LARGE, error.to_string());
            }
            Err(error) => {
                let error = GatewayError::RequestBodyError(error.to_string());
                tracing::debug!(error = %error, "rejecting request");
                return envelope_response(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };

        let key = match derive_key(&parts, &body, self.settings.require_key) {
            Ok(key) => key,
            Err(error) => {
                tracing::debug!(error = %error, "rejecting request");
                return envelope_response(StatusCode::BAD_REQUEST, error.to_string());
            }
        };
        let fingerprint = fingerprint(&body);

        let state = match self.store.acquire(&key, &fingerprint).await {
            Ok(state) => state,
            Err(error) => {
                counter!(ACQUIRE, "outcome" => "error").increment(1);
                tracing::warn!(key = %key, error = %error, "idempotency store unavailable");
                return match self.settings.failure_mode {
                    FailureMode::FailOpen => {
                        counter!(BYPASS).increment(1);
                        self.forward(parts, body).await
                    }
                    FailureMode::FailClosed => envelope_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Idempotency store unavailable",
                    ),
                };
            }
        };
        counter!(ACQUIRE, "outcome" => state.as_str()).increment(1);

        match state {
            AcquireState::First => self.execute(key, parts, body).await,
            AcquireState::InFlight => {
                tracing::debug!(key = %key, state = "in_flight", "duplicate request while processing");
                let mut response = envelope_response(StatusCode::CONFLICT, IN_FLIGHT_MESSAGE);
                response.headers_mut().insert(
                    RETRY_AFTER,
                    HeaderValue::from(self.settings.retry_after_secs),
                );
                response
            }
            AcquireState::Done(captured) => {
                tracing::debug!(key = %key, state = "done", status = captured.status.as_u16(), "replaying stored response");
                captured.replay().map(|body| boxed(Full::new(body)))
            }
            AcquireState::Mismatch => {
                tracing::debug!(key = %key, state = "mismatch", "idempotency key reused with another body");
                envelope_response(StatusCode::CONFLICT, MISMATCH_MESSAGE)
            }
        }
    }

    async fn forward(&self, parts: Parts, body: Bytes) -> Response<HandlerBody> {
        let request = Request::from_parts(parts, boxed(Full::new(body)));
        self.downstream.call(request).await
    }

    // Only a 2xx is kept. Anything else releases the key before the client
    // sees the response so that a retry runs again.
    async fn execute(&self, key: String, parts: Parts, body: Bytes) -> Response<HandlerBody> {
        let response = self.forward(parts, body).await;
        let (parts, body) = response.into_parts();

        if parts.status.is_success() {
            let capture = Capture::new(
                self.store.clone(),
                key,
                parts.status,
                &parts.headers,
                self.settings.capture_limit_bytes,
            );
            let body = CaptureBody::new(body, capture).settle_if_empty().await;
            return Response::from_parts(parts, body.boxed_unsync());
        }

        tracing::debug!(key = %key, status = parts.status.as_u16(), "releasing key after unsuccessful response");
        let reason = ClearReason::from_status(parts.status);
        settle(self.store.clone(), key, Outcome::Clear(reason)).await;
        Response::from_parts(parts, body)
    }
}
