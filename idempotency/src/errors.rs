use crate::config::ValidationError;
use crate::engine::StoreError;
use crate::key::KeyError;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Errors that can occur while the gateway handles a request
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Invalid idempotency key: {0}")]
    BadKey(#[from] KeyError),

    #[error("Idempotency store error: {0}")]
    Store(#[from] StoreError),

    #[error("Upstream request failed for {0}: {1}")]
    UpstreamRequestFailed(String, String),

    #[error("Upstream timeout for {0}")]
    UpstreamTimeout(String),

    #[error("Failed to read response body: {0}")]
    ResponseBodyError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
