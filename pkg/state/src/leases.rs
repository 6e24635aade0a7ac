use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pkg_types::lease::LeaseRecord;
use tracing::warn;

use crate::keys::KeySpace;
use crate::store::{Entry, KvStore, StoreError, with_timeout};

/// Per-session lease records in the shared store.
///
/// The lease key's owner is the authority; the JSON payload only carries
/// timestamps for display.
pub struct LeaseStore {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    op_timeout: Duration,
}

impl LeaseStore {
    pub fn new(store: Arc<dyn KvStore>, keys: KeySpace, op_timeout: Duration) -> Self {
        Self {
            store,
            keys,
            op_timeout,
        }
    }

    fn entry(record: &LeaseRecord) -> Result<Entry, StoreError> {
        Ok(Entry::new(
            record.owner_id.clone(),
            serde_json::to_string(record)?,
        ))
    }

    /// Take the lease if it is vacant, expired, or already ours.
    pub async fn try_acquire(
        &self,
        session_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<Option<LeaseRecord>, StoreError> {
        let record = LeaseRecord::new(instance_id);
        let entry = Self::entry(&record)?;
        let key = self.keys.lease(session_id);
        let acquired = with_timeout(
            self.op_timeout,
            self.store.put_if_vacant_or_owned(&key, &entry, ttl),
        )
        .await?;
        Ok(acquired.then_some(record))
    }

    /// Extend the TTL only while `held.owner_id` still owns the lease.
    pub async fn renew(
        &self,
        session_id: &str,
        held: &LeaseRecord,
        ttl: Duration,
    ) -> Result<Option<LeaseRecord>, StoreError> {
        let record = held.renewed();
        let entry = Self::entry(&record)?;
        let key = self.keys.lease(session_id);
        let renewed =
            with_timeout(self.op_timeout, self.store.put_if_owned(&key, &entry, ttl)).await?;
        Ok(renewed.then_some(record))
    }

    /// Delete the lease only if `instance_id` owns it. Returns whether a
    /// lease was actually removed.
    pub async fn release(&self, session_id: &str, instance_id: &str) -> Result<bool, StoreError> {
        self.release_within(session_id, instance_id, self.op_timeout)
            .await
    }

    /// Like [`release`](Self::release) with an explicit bound, used during
    /// shutdown.
    pub async fn release_within(
        &self,
        session_id: &str,
        instance_id: &str,
        limit: Duration,
    ) -> Result<bool, StoreError> {
        let key = self.keys.lease(session_id);
        with_timeout(limit, self.store.delete_if_owned(&key, instance_id)).await
    }

    /// Current lease for one session, if any.
    pub async fn get(&self, session_id: &str) -> Result<Option<LeaseRecord>, StoreError> {
        let key = self.keys.lease(session_id);
        let entry = with_timeout(self.op_timeout, self.store.get(&key)).await?;
        Ok(entry.map(|e| Self::decode(session_id, e)))
    }

    /// Every live lease, keyed by session ID.
    pub async fn read_all(&self) -> Result<HashMap<String, LeaseRecord>, StoreError> {
        let prefix = self.keys.lease_prefix();
        let entries = with_timeout(self.op_timeout, self.store.scan_prefix(&prefix)).await?;
        let mut leases = HashMap::with_capacity(entries.len());
        for (key, entry) in entries {
            if let Some(session_id) = key.strip_prefix(&prefix) {
                let record = Self::decode(session_id, entry);
                leases.insert(session_id.to_string(), record);
            }
        }
        Ok(leases)
    }

    /// Owner always comes from the entry; timestamps fall back to the epoch
    /// when the payload is unreadable.
    fn decode(session_id: &str, entry: Entry) -> LeaseRecord {
        match serde_json::from_str::<LeaseRecord>(&entry.data) {
            Ok(mut record) => {
                record.owner_id = entry.owner;
                record
            }
            Err(e) => {
                warn!("Unreadable lease payload for session {}: {}", session_id, e);
                LeaseRecord {
                    owner_id: entry.owner,
                    acquired_at: DateTime::<Utc>::UNIX_EPOCH,
                    last_renewed_at: DateTime::<Utc>::UNIX_EPOCH,
                }
            }
        }
    }
}
