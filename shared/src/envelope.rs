//! The JSON envelope shared by every service response.

use http::header::{CONTENT_TYPE, HeaderValue};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};

/// `{message, payload, success, userExists}`.
///
/// Gateway-generated answers leave the payload as `null`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse<T = serde_json::Value> {
    pub message: String,
    pub payload: Option<T>,
    pub success: bool,
    pub user_exists: bool,
}

impl ServiceResponse {
    /// An unsuccessful envelope without payload.
    pub fn error(message: impl Into<String>) -> Self {
        ServiceResponse {
            message: message.into(),
            payload: None,
            success: false,
            user_exists: true,
        }
    }
}

impl<T: Serialize> ServiceResponse<T> {
    /// Renders the envelope as a JSON response with the given status.
    pub fn into_response(self, status: StatusCode) -> Response<Full<Bytes>> {
        let body = match serde_json::to_vec(&self) {
            Ok(bytes) => Bytes::from(bytes),
            Err(error) => {
                tracing::error!(error = %error, "failed to serialize response envelope");
                Bytes::from_static(b"{\"message\":\"internal error\",\"payload\":null,\"success\":false,\"userExists\":false}")
            }
        };

        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}
