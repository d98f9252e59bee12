use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Empty key prefix")]
    EmptyKeyPrefix,

    #[error("{0} must be greater than 0")]
    NotPositive(&'static str),

    #[error("Upstream URL must use http, got {0}")]
    UnsupportedUpstreamScheme(String),
}

/// Gateway configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for proxied requests
    pub listener: Listener,
    /// Listener for health and readiness probes
    pub admin_listener: Listener,
    /// The service the gateway protects
    pub upstream: UpstreamConfig,
    /// Where slots are kept
    pub store: StoreConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        self.upstream.validate()?;
        self.store.validate()?;
        self.idempotency.validate()?;
        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Base URL requests are forwarded to
    pub url: Url,
    /// Time allowed until the upstream response headers arrive
    #[serde(default = "default_upstream_timeout_secs")]
    pub timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        // The forwarding client has no TLS connector.
        if self.url.scheme() != "http" {
            return Err(ValidationError::UnsupportedUpstreamScheme(
                self.url.scheme().to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::NotPositive("upstream.timeout_secs"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(flatten)]
    pub backend: StoreBackend,
    /// Deadline for a single store call
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.timeout_ms == 0 {
            return Err(ValidationError::NotPositive("store.timeout_ms"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreBackend {
    /// Falls back to the REDIS_URL environment variable when `url` is unset.
    Redis { url: Option<String> },
    /// Process-local; duplicates are only detected within one instance.
    Memory,
}

/// What to do when the store cannot be reached.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Forward the request without duplicate protection.
    #[default]
    FailOpen,
    /// Answer 503.
    FailClosed,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub key_prefix: String,
    pub failure_mode: FailureMode,
    /// Reject mutating requests without an Idempotency-Key header instead of
    /// deriving one.
    pub require_key: bool,
    pub max_body_bytes: usize,
    pub capture_limit_bytes: usize,
    pub retry_after_secs: u64,
    /// Overrides IDEM_PROCESSING_TTL_MS
    pub processing_ttl_ms: Option<u64>,
    /// Overrides IDEM_DONE_TTL_MS
    pub done_ttl_ms: Option<u64>,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        IdempotencyConfig {
            key_prefix: "idem:".to_string(),
            failure_mode: FailureMode::FailOpen,
            require_key: false,
            max_body_bytes: 8 * 1024 * 1024,
            capture_limit_bytes: 1024 * 1024,
            retry_after_secs: 3,
            processing_ttl_ms: None,
            done_ttl_ms: None,
        }
    }
}

impl IdempotencyConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.key_prefix.is_empty() {
            return Err(ValidationError::EmptyKeyPrefix);
        }
        if self.max_body_bytes == 0 {
            return Err(ValidationError::NotPositive("idempotency.max_body_bytes"));
        }
        if self.capture_limit_bytes == 0 {
            return Err(ValidationError::NotPositive(
                "idempotency.capture_limit_bytes",
            ));
        }
        if self.retry_after_secs == 0 {
            return Err(ValidationError::NotPositive("idempotency.retry_after_secs"));
        }
        if self.processing_ttl_ms == Some(0) {
            return Err(ValidationError::NotPositive("idempotency.processing_ttl_ms"));
        }
        if self.done_ttl_ms == Some(0) {
            return Err(ValidationError::NotPositive("idempotency.done_ttl_ms"));
        }
        Ok(())
    }
}

fn default_upstream_timeout_secs() -> u64 {
    30
}

fn default_store_timeout_ms() -> u64 {
    500
}
