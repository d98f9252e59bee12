use crate::errors::{GatewayError, Result};
use async_trait::async_trait;
use http::StatusCode;
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::{Body, Bytes};
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use shared::envelope::ServiceResponse;
use shared::http::{add_via_header, filter_hop_by_hop};
use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

/// Body type flowing between the gateway and its downstream.
pub type HandlerBody = UnsyncBoxBody<Bytes, GatewayError>;

pub fn boxed<B>(body: B) -> HandlerBody
where
    B: Body<Data = Bytes, Error = Infallible> + Send + 'static,
{
    body.map_err(|never| match never {}).boxed_unsync()
}

/// Gateway-generated answer in the shared JSON envelope.
pub fn envelope_response(status: StatusCode, message: impl Into<String>) -> Response<HandlerBody> {
    ServiceResponse::error(message)
        .into_response(status)
        .map(boxed)
}

/// Whatever executes a request once the gateway lets it through.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn call(&self, request: Request<HandlerBody>) -> Response<HandlerBody>;
}

#[async_trait]
impl<F, Fut> Downstream for F
where
    F: Fn(Request<HandlerBody>) -> Fut + Send + Sync,
    Fut: Future<Output = Response<HandlerBody>> + Send + 'static,
{
    async fn call(&self, request: Request<HandlerBody>) -> Response<HandlerBody> {
        (self)(request).await
    }
}

/// Forwards requests to a single upstream over HTTP.
pub struct UpstreamForwarder {
    client: Client<HttpConnector, HandlerBody>,
    upstream_url: Url,
    timeout: Duration,
}

impl UpstreamForwarder {
    pub fn new(upstream_url: Url, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        UpstreamForwarder {
            client,
            upstream_url,
            timeout,
        }
    }

    /// Sends `request` to the upstream and returns its response with the body
    /// still streaming.
    ///
    /// The timeout covers connecting, sending the request and receiving the
    /// response headers. It does not cover the response body.
    pub async fn send(&self, request: Request<HandlerBody>) -> Result<Response<HandlerBody>> {
        let upstream_identifier = self
            .upstream_url
            .host_str()
            .unwrap_or(self.upstream_url.as_str())
            .to_string();

        let path_and_query = match request.uri().path_and_query() {
            Some(pq) => pq.as_str().to_string(),
            None => {
                return Err(GatewayError::InternalError(
                    "Request URI missing path and query".to_string(),
                ));
            }
        };

        let mut url = self.upstream_url.clone();
        if let Some((path, query)) = path_and_query.split_once('?') {
            url.set_path(path);
            url.set_query(Some(query));
        } else {
            url.set_path(&path_and_query);
        }

        let (mut parts, body) = request.into_parts();
        let request_version = parts.version;
        filter_hop_by_hop(&mut parts.headers, request_version);
        add_via_header(&mut parts.headers, request_version);

        // The upstream connection is HTTP/1.1 whatever the client spoke.
        let mut req_builder = Request::builder().method(parts.method).uri(url.as_str());
        for (name, value) in parts.headers.iter() {
            req_builder = req_builder.header(name, value);
        }
        let upstream_request = req_builder
            .body(body)
            .map_err(|e| GatewayError::InternalError(format!("Failed to build request: {e}")))?;

        let response = timeout(self.timeout, self.client.request(upstream_request))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout(upstream_identifier.clone()))?
            .map_err(|e| GatewayError::UpstreamRequestFailed(upstream_identifier, e.to_string()))?;

        let (mut parts, body) = response.into_parts();
        let response_version = parts.version;
        filter_hop_by_hop(&mut parts.headers, response_version);
        add_via_header(&mut parts.headers, response_version);

        let body = body
            .map_err(|e| GatewayError::ResponseBodyError(e.to_string()))
            .boxed_unsync();
        Ok(Response::from_parts(parts, body))
    }
}

#[async_trait]
impl Downstream for UpstreamForwarder {
    async fn call(&self, request: Request<HandlerBody>) -> Response<HandlerBody> {
        match self.send(request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(error = %error, "upstream request failed");
                match error {
                    GatewayError::UpstreamTimeout(_) => {
                        envelope_response(StatusCode::GATEWAY_TIMEOUT, "Upstream timed out")
                    }
                    GatewayError::UpstreamRequestFailed(..) => {
                        envelope_response(StatusCode::BAD_GATEWAY, "Upstream unavailable")
                    }
                    _ => envelope_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper_util::server::conn::auto::Builder;
    use tokio::net::TcpListener;

    // Echoes the request body and headers back, plus the path it was asked for.
    async fn echo_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_else(|_| Bytes::new());

        let mut response = Response::new(Full::new(body_bytes));
        *response.headers_mut() = parts.headers;
        response.headers_mut().insert(
            "x-echo-path",
            parts.uri.path_and_query().unwrap().as_str().parse().unwrap(),
        );
        Ok(response)
    }

    async fn start_test_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to address");
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = hyper_util::rt::TokioIo::new(stream);
                tokio::spawn(async move {
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(io, service_fn(echo_handler))
                        .await;
                });
            }
        });

        port
    }

    fn request(uri: &str, body: &'static [u8]) -> Request<HandlerBody> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("connection", "keep-alive")
            .header("x-custom", "test-value")
            .body(boxed(Full::new(Bytes::from_static(body))))
            .unwrap()
    }

    #[tokio::test]
    async fn test_forward_success() {
        let port = start_test_server().await;
        let upstream_url = Url::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let forwarder = UpstreamForwarder::new(upstream_url, Duration::from_secs(5));

        let response = forwarder
            .send(request("http://gateway.local/api/v1/stockIn?foo=bar", b"hello world"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-echo-path"], "/api/v1/stockIn?foo=bar");
        assert_eq!(response.headers()["x-custom"], "test-value");
        assert!(response.headers().contains_key("via"));
        assert!(!response.headers().contains_key("connection"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn test_forward_timeout() {
        // Non-routable address, the connect never completes.
        let upstream_url = Url::parse("http://192.0.2.1:9999").unwrap();
        let forwarder = UpstreamForwarder::new(upstream_url, Duration::from_millis(200));

        let result = forwarder.send(request("http://gateway.local/x", b"test")).await;
        assert!(matches!(result, Err(GatewayError::UpstreamTimeout(_))));
    }

    #[tokio::test]
    async fn test_connection_refused_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let upstream_url = Url::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let forwarder = UpstreamForwarder::new(upstream_url, Duration::from_secs(5));

        let response = Downstream::call(&forwarder, request("http://gateway.local/x", b"test")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let envelope: ServiceResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(envelope.message, "Upstream unavailable");
        assert!(!envelope.success);
    }

    #[tokio::test]
    async fn test_closures_are_downstreams() {
        let downstream = |req: Request<HandlerBody>| async move {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            Response::new(boxed(Full::new(body)))
        };
        let response = Downstream::call(&downstream, request("/x", b"abc")).await;
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"abc");
    }
}
