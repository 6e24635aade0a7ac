use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::store::{Entry, KvStore, StoreError};

struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|t| now < t)
    }
}

/// In-process store. Clones share the same map, so several coordinators in
/// one process (or one test) see a single fleet.
///
/// Expiry runs on the tokio clock, which makes TTL behaviour deterministic
/// under `start_paused` tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    slots: Arc<Mutex<BTreeMap<String, Slot>>>,
    unavailable: Arc<AtomicBool>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a backend error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every operation, to exercise caller-side timeouts.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().await = latency;
    }

    async fn check(&self) -> Result<(), StoreError> {
        let latency = *self.latency.lock().await;
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("memory store unavailable".into()));
        }
        Ok(())
    }

    fn live_owner<'a>(
        slots: &'a BTreeMap<String, Slot>,
        key: &str,
        now: Instant,
    ) -> Option<&'a str> {
        slots
            .get(key)
            .filter(|s| s.is_live(now))
            .map(|s| s.entry.owner.as_str())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        self.check().await?;
        let now = Instant::now();
        let slots = self.slots.lock().await;
        Ok(slots
            .get(key)
            .filter(|s| s.is_live(now))
            .map(|s| s.entry.clone()))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Entry)>, StoreError> {
        self.check().await?;
        let now = Instant::now();
        let mut slots = self.slots.lock().await;
        slots.retain(|_, s| s.is_live(now));
        Ok(slots
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, s)| (k.clone(), s.entry.clone()))
            .collect())
    }

    async fn put(
        &self,
        key: &str,
        entry: &Entry,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.check().await?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.slots.lock().await.insert(
            key.to_string(),
            Slot {
                entry: entry.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn put_if_vacant_or_owned(
        &self,
        key: &str,
        entry: &Entry,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check().await?;
        let now = Instant::now();
        let mut slots = self.slots.lock().await;
        if Self::live_owner(&slots, key, now).is_some_and(|owner| owner != entry.owner) {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                entry: entry.clone(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn put_if_owned(
        &self,
        key: &str,
        entry: &Entry,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check().await?;
        let now = Instant::now();
        let mut slots = self.slots.lock().await;
        if Self::live_owner(&slots, key, now) != Some(entry.owner.as_str()) {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                entry: entry.clone(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete_if_owned(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        self.check().await?;
        let now = Instant::now();
        let mut slots = self.slots.lock().await;
        if Self::live_owner(&slots, key, now) != Some(owner) {
            return Ok(false);
        }
        slots.remove(key);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check().await?;
        self.slots.lock().await.remove(key);
        Ok(())
    }
}
