use crate::downstream::HandlerBody;
use crate::errors::GatewayError;
use crate::gateway::Gateway;
use crate::metrics_defs::REQUEST_DURATION;
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Request, Response};
use shared::histogram;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

/// Hyper entry point for the gateway listener.
pub struct GatewayService {
    gateway: Arc<Gateway>,
}

impl GatewayService {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

impl Service<Request<Incoming>> for GatewayService {
    type Response = Response<HandlerBody>;
    type Error = GatewayError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let gateway = self.gateway.clone();
        Box::pin(async move {
            let start = Instant::now();
            let method = req.method().to_string();
            let response = gateway.handle(req).await;
            // Time to response headers; the body may still be streaming.
            histogram!(
                REQUEST_DURATION,
                "method" => method,
                "status" => response.status().as_u16().to_string()
            )
            .record(start.elapsed().as_secs_f64());
            Ok(response)
        })
    }
}
