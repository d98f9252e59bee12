//! Idempotency key derivation and body fingerprints.

use http::request::Parts;
use http::{HeaderMap, Method};
use sha2::{Digest, Sha256};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const MAX_KEY_LEN: usize = 256;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Idempotency-Key must be at most {MAX_KEY_LEN} bytes")]
    TooLong,

    #[error("Idempotency-Key must be printable ASCII")]
    NotPrintable,

    #[error("Missing Idempotency-Key")]
    Missing,
}

/// The trimmed client-supplied key, or `None` if the header is absent or blank.
pub fn client_key(headers: &HeaderMap) -> Result<Option<String>, KeyError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };

    let key = value.as_bytes().trim_ascii();
    if key.is_empty() {
        return Ok(None);
    }
    if key.len() > MAX_KEY_LEN {
        return Err(KeyError::TooLong);
    }
    if !key.iter().all(|b| (0x20..=0x7e).contains(b)) {
        return Err(KeyError::NotPrintable);
    }

    // Every byte is printable ASCII at this point.
    Ok(Some(key.iter().map(|&b| b as char).collect()))
}

/// Key for requests that carry no header: sha256 of `method|path|body`.
pub fn synthetic_key(method: &Method, path: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(path.as_bytes());
    hasher.update(b"|");
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Client key if present. Otherwise a synthetic key, or [`KeyError::Missing`]
/// when `require_key` is set.
pub fn derive_key(parts: &Parts, body: &[u8], require_key: bool) -> Result<String, KeyError> {
    match client_key(&parts.headers)? {
        Some(key) => Ok(key),
        None if require_key => Err(KeyError::Missing),
        None => Ok(synthetic_key(&parts.method, parts.uri.path(), body)),
    }
}

/// Lowercase hex sha256 of the request body.
pub fn fingerprint(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}
