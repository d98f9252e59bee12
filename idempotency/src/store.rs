use crate::engine::{AcquireReply, Completion, ScriptEngine, StoreError};
use crate::metrics_defs::STORE_DURATION;
use crate::slot::{CapturedResponse, Slot};
use crate::ttl::Ttls;
use shared::histogram;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Outcome of [`IdemStore::acquire`].
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireState {
    First,
    InFlight,
    Done(CapturedResponse),
    Mismatch,
}

impl AcquireState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquireState::First => "first",
            AcquireState::InFlight => "in_flight",
            AcquireState::Done(_) => "done",
            AcquireState::Mismatch => "mismatch",
        }
    }
}

/// Namespaced slot operations with TTLs and per-call deadlines.
///
/// Cheap to clone; clones share the engine and the health flag.
#[derive(Clone)]
pub struct IdemStore {
    engine: Arc<dyn ScriptEngine>,
    prefix: String,
    ttls: Ttls,
    timeout: Duration,
    healthy: Arc<AtomicBool>,
}

impl IdemStore {
    pub fn new(
        engine: Arc<dyn ScriptEngine>,
        prefix: impl Into<String>,
        ttls: Ttls,
        timeout: Duration,
    ) -> Self {
        IdemStore {
            engine,
            prefix: prefix.into(),
            ttls,
            timeout,
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn ttls(&self) -> Ttls {
        self.ttls
    }

    pub fn slot_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// False after the last store call failed, until one succeeds again.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };
        histogram!(STORE_DURATION, "op" => op).record(start.elapsed().as_secs_f64());
        self.healthy.store(result.is_ok(), Ordering::Relaxed);
        result
    }

    /// Claims `key` for `fingerprint`, or reports who holds it.
    pub async fn acquire(&self, key: &str, fingerprint: &str) -> Result<AcquireState, StoreError> {
        let slot_key = self.slot_key(key);
        let processing = Slot::processing(fingerprint, unix_millis()).encode()?;
        let reply = self
            .call(
                "acquire",
                self.engine
                    .acquire(&slot_key, &processing, fingerprint, self.ttls.processing),
            )
            .await?;

        match reply {
            AcquireReply::First => Ok(AcquireState::First),
            AcquireReply::InFlight => Ok(AcquireState::InFlight),
            AcquireReply::Mismatch => Ok(AcquireState::Mismatch),
            AcquireReply::Done(raw) => {
                let response = Slot::decode(&raw)?.into_response()?;
                Ok(AcquireState::Done(response))
            }
        }
    }

    /// Stores `response` for replay. Returns false if the processing slot was
    /// gone, which happens when the handler outlived the processing TTL.
    pub async fn complete(&self, key: &str, response: &CapturedResponse) -> Result<bool, StoreError> {
        let slot_key = self.slot_key(key);
        let body = response.encoded_body();
        let headers = response.header_map();
        let completion = Completion {
            status: response.status.as_u16(),
            body: &body,
            headers: &headers,
        };
        self.call(
            "complete",
            self.engine.complete(&slot_key, completion, self.ttls.done),
        )
        .await
    }

    pub async fn clear(&self, key: &str) -> Result<(), StoreError> {
        let slot_key = self.slot_key(key);
        self.call("clear", self.engine.delete(&slot_key)).await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.call("ping", self.engine.ping()).await
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::testutils::{FailingEngine, StallingEngine};
    use http::{HeaderMap, StatusCode};
    use hyper::body::Bytes;

    fn memory_store() -> (Arc<MemoryEngine>, IdemStore) {
        let engine = Arc::new(MemoryEngine::new());
        let store = IdemStore::new(
            engine.clone(),
            "idem:",
            Ttls::default(),
            Duration::from_millis(500),
        );
        (engine, store)
    }

    fn ok_response() -> CapturedResponse {
        CapturedResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{\"ok\":true}"),
        }
    }

    #[tokio::test]
    async fn test_slot_keys_are_prefixed() {
        let (engine, store) = memory_store();
        assert_eq!(store.slot_key("k1"), "idem:k1");

        store.acquire("k1", "h").await.unwrap();
        let raw = engine.get("idem:k1").unwrap();
        let slot = Slot::decode(&raw).unwrap();
        assert!(slot.is_processing());
        assert_eq!(slot.fingerprint(), "h");
    }

    #[tokio::test]
    async fn test_acquire_complete_replay() {
        let (_, store) = memory_store();
        assert_eq!(store.acquire("k1", "h").await.unwrap(), AcquireState::First);
        assert_eq!(store.acquire("k1", "h").await.unwrap(), AcquireState::InFlight);

        assert!(store.complete("k1", &ok_response()).await.unwrap());
        assert_eq!(
            store.acquire("k1", "h").await.unwrap(),
            AcquireState::Done(ok_response())
        );
        assert_eq!(store.acquire("k1", "other").await.unwrap(), AcquireState::Mismatch);
    }

    #[tokio::test]
    async fn test_clear_allows_reacquire() {
        let (engine, store) = memory_store();
        store.acquire("k1", "h").await.unwrap();
        store.clear("k1").await.unwrap();
        assert!(engine.is_empty());
        assert_eq!(store.acquire("k1", "h2").await.unwrap(), AcquireState::First);
    }

    #[tokio::test]
    async fn test_complete_after_expiry_is_skipped() {
        let (_, store) = memory_store();
        assert!(!store.complete("never-acquired", &ok_response()).await.unwrap());
    }

    #[tokio::test]
    async fn test_errors_mark_store_unhealthy() {
        let store = IdemStore::new(
            Arc::new(FailingEngine),
            "idem:",
            Ttls::default(),
            Duration::from_millis(500),
        );
        assert!(store.is_healthy());
        assert!(store.acquire("k1", "h").await.is_err());
        assert!(!store.is_healthy());
        assert!(store.ping().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_are_bounded_by_timeout() {
        let store = IdemStore::new(
            Arc::new(StallingEngine),
            "idem:",
            Ttls::default(),
            Duration::from_millis(50),
        );
        let result = store.acquire("k1", "h").await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
        assert!(!store.is_healthy());
    }
}
