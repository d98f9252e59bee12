// In-process engine for single-instance deployments and tests. Expiry runs on
// the tokio clock so paused-time tests can step over TTLs.
use super::{AcquireReply, Completion, ScriptEngine, StoreError};
use crate::slot::{SLOT_VERSION, Slot};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

const PURGE_THRESHOLD: usize = 4096;

struct Entry {
    raw: String,
    expires_at: Instant,
}

// Expired entries are swept once the map reaches `purge_at`. The next sweep
// waits until the map has doubled from what survived, so a map full of live
// slots is not rescanned on every acquire.
struct Slots {
    entries: HashMap<String, Entry>,
    purge_at: usize,
}

impl Default for Slots {
    fn default() -> Self {
        Slots {
            entries: HashMap::new(),
            purge_at: PURGE_THRESHOLD,
        }
    }
}

impl Slots {
    fn maybe_purge(&mut self, now: Instant) {
        if self.entries.len() < self.purge_at {
            return;
        }
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.purge_at = (self.entries.len() * 2).max(PURGE_THRESHOLD);
    }
}

#[derive(Default)]
pub struct MemoryEngine {
    slots: Mutex<Slots>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value currently stored under `slot_key`, ignoring expired entries.
    pub fn get(&self, slot_key: &str) -> Option<String> {
        let now = Instant::now();
        self.slots
            .lock()
            .entries
            .get(slot_key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.raw.clone())
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots
            .lock()
            .entries
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ScriptEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn acquire(
        &self,
        slot_key: &str,
        processing: &str,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<AcquireReply, StoreError> {
        let now = Instant::now();
        let mut slots = self.slots.lock();

        slots.maybe_purge(now);

        let current = slots
            .entries
            .get(slot_key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.raw.clone());

        let Some(raw) = current else {
            slots.entries.insert(
                slot_key.to_string(),
                Entry {
                    raw: processing.to_string(),
                    expires_at: now + ttl,
                },
            );
            return Ok(AcquireReply::First);
        };

        let slot = Slot::decode(&raw)?;
        if slot.fingerprint() != fingerprint {
            Ok(AcquireReply::Mismatch)
        } else if slot.is_processing() {
            Ok(AcquireReply::InFlight)
        } else {
            Ok(AcquireReply::Done(raw))
        }
    }

    async fn complete(
        &self,
        slot_key: &str,
        completion: Completion<'_>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut slots = self.slots.lock();

        let Some(entry) = slots.entries.get_mut(slot_key).filter(|e| e.expires_at > now) else {
            return Ok(false);
        };
        let Ok(Slot::Processing { h, .. }) = Slot::decode(&entry.raw) else {
            return Ok(false);
        };

        let done = Slot::Done {
            v: SLOT_VERSION,
            h,
            status: completion.status,
            body: completion.body.to_string(),
            hdr: completion.headers.clone(),
        };
        entry.raw = done.encode()?;
        entry.expires_at = now + ttl;
        Ok(true)
    }

    async fn delete(&self, slot_key: &str) -> Result<(), StoreError> {
        self.slots.lock().entries.remove(slot_key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
