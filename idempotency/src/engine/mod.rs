//! Atomic slot operations against a key-value store.
//!
//! Both acquire and complete are a read followed by a conditional write. An
//! engine must run each of them as one indivisible step on the store side;
//! emulating them with separate client-side reads and writes would let two
//! workers acquire the same key.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

pub use self::memory::MemoryEngine;
pub use self::redis::RedisEngine;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store is not configured: {0}")]
    NotConfigured(String),

    #[error("corrupt slot value: {0}")]
    CorruptSlot(String),

    #[error("unexpected script reply: {0}")]
    UnexpectedReply(String),
}

/// Result of the acquire script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireReply {
    /// No slot existed; the processing slot has been written.
    First,
    /// A processing slot with the same fingerprint exists.
    InFlight,
    /// A done slot with the same fingerprint exists. Carries the raw value.
    Done(String),
    /// A slot with a different fingerprint exists.
    Mismatch,
}

/// Fields written when a processing slot is promoted to done.
#[derive(Debug, Clone, Copy)]
pub struct Completion<'a> {
    pub status: u16,
    /// Base64 of the response body.
    pub body: &'a str,
    pub headers: &'a BTreeMap<String, String>,
}

#[async_trait]
pub trait ScriptEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Writes `processing` under `slot_key` with `ttl` unless a slot exists,
    /// in which case the existing slot is classified against `fingerprint`.
    async fn acquire(
        &self,
        slot_key: &str,
        processing: &str,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<AcquireReply, StoreError>;

    /// Replaces a processing slot with a done slot that keeps its fingerprint.
    /// Returns false, without writing, if the slot is missing or not processing.
    async fn complete(
        &self,
        slot_key: &str,
        completion: Completion<'_>,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, slot_key: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Positive TTL in whole milliseconds, as `PX` expects.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
