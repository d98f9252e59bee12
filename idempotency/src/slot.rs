//! Values stored under an idempotency key.
//!
//! A slot is a small JSON document tagged by `kind`:
//!
//! ```text
//! {"v":1,"kind":"processing","h":"<hex>","acquired_at":<unix ms>}
//! {"v":1,"kind":"done","h":"<hex>","status":200,"body":"<base64>","hdr":{"content-type":"..."}}
//! ```
//!
//! The Lua scripts in [`crate::engine::redis`] read and write the same layout.

use crate::engine::StoreError;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use http::header::{CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue};
use http::{Response, StatusCode};
use hyper::body::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SLOT_VERSION: u8 = 1;

/// Handler-set header that is kept and replayed so clients can correlate
/// replayed responses.
pub const IDEMPOTENCY_REF_HEADER: &str = "idempotency-ref";

/// Response headers kept with a captured response.
pub const CAPTURED_HEADERS: [&str; 3] = ["content-type", "content-language", IDEMPOTENCY_REF_HEADER];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Slot {
    Processing {
        v: u8,
        h: String,
        acquired_at: u64,
    },
    Done {
        v: u8,
        h: String,
        status: u16,
        body: String,
        #[serde(default)]
        hdr: BTreeMap<String, String>,
    },
}

impl Slot {
    pub fn processing(fingerprint: &str, acquired_at_ms: u64) -> Slot {
        Slot::Processing {
            v: SLOT_VERSION,
            h: fingerprint.to_string(),
            acquired_at: acquired_at_ms,
        }
    }

    pub fn done(fingerprint: &str, response: &CapturedResponse) -> Slot {
        Slot::Done {
            v: SLOT_VERSION,
            h: fingerprint.to_string(),
            status: response.status.as_u16(),
            body: response.encoded_body(),
            hdr: response.header_map(),
        }
    }

    pub fn fingerprint(&self) -> &str {
        match self {
            Slot::Processing { h, .. } | Slot::Done { h, .. } => h,
        }
    }

    pub fn is_processing(&self) -> bool {
        matches!(self, Slot::Processing { .. })
    }

    pub fn encode(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::CorruptSlot(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Slot, StoreError> {
        let slot: Slot =
            serde_json::from_str(raw).map_err(|e| StoreError::CorruptSlot(e.to_string()))?;
        let version = match &slot {
            Slot::Processing { v, .. } | Slot::Done { v, .. } => *v,
        };
        if version != SLOT_VERSION {
            return Err(StoreError::CorruptSlot(format!(
                "unsupported slot version {version}"
            )));
        }
        Ok(slot)
    }

    /// The stored response of a done slot.
    pub fn into_response(self) -> Result<CapturedResponse, StoreError> {
        let Slot::Done {
            status, body, hdr, ..
        } = self
        else {
            return Err(StoreError::CorruptSlot(
                "slot is still processing".to_string(),
            ));
        };

        let status = StatusCode::from_u16(status)
            .map_err(|_| StoreError::CorruptSlot(format!("invalid status {status}")))?;
        let body = STANDARD
            .decode(body.as_bytes())
            .map_err(|e| StoreError::CorruptSlot(format!("invalid body encoding: {e}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in hdr {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| StoreError::CorruptSlot(format!("invalid header name: {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| StoreError::CorruptSlot(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }

        Ok(CapturedResponse {
            status,
            headers,
            body: Bytes::from(body),
        })
    }
}

/// A downstream response as it is stored for replay.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedResponse {
    pub status: StatusCode,
    /// Only the names listed in [`CAPTURED_HEADERS`].
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CapturedResponse {
    pub fn encoded_body(&self) -> String {
        STANDARD.encode(&self.body)
    }

    /// Captured headers keyed by lowercase name. Values that are not visible
    /// ASCII cannot be stored and are dropped.
    pub fn header_map(&self) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect()
    }

    /// Rebuilds the response that was originally sent.
    pub fn replay(&self) -> Response<Bytes> {
        let mut response = Response::new(self.body.clone());
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        response
    }
}

/// Copies the replayable subset of `headers`.
pub fn select_captured_headers(headers: &HeaderMap) -> HeaderMap {
    let mut selected = HeaderMap::new();
    for name in CAPTURED_HEADERS {
        if let Some(value) = headers.get(name) {
            selected.insert(HeaderName::from_static(name), value.clone());
        }
    }
    selected
}
