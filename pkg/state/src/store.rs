use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// A stored value together with the instance that logically writes it.
///
/// Conditional operations compare against `owner` only, so the payload can
/// change on every write (timestamps) without breaking compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub owner: String,
    pub data: String,
}

impl Entry {
    pub fn new(owner: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            data: data.into(),
        }
    }
}

/// Versionless key/value store with TTLs and owner-guarded conditional writes.
///
/// Each method is a single atomic round-trip. Expired entries are invisible
/// to every operation. Any store offering compare-and-set on one attribute
/// (Redis scripts, SQL `WHERE owner = ?`, etcd txn, DynamoDB conditions) can
/// implement it.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Short backend name for logs and the fleet status endpoint.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError>;

    /// All live entries whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Entry)>, StoreError>;

    /// Unconditional upsert. `None` means no expiry.
    async fn put(&self, key: &str, entry: &Entry, ttl: Option<Duration>)
    -> Result<(), StoreError>;

    /// Write only if the key is vacant (or expired) or already owned by
    /// `entry.owner`. Returns whether the write happened.
    async fn put_if_vacant_or_owned(
        &self,
        key: &str,
        entry: &Entry,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Write only if the key currently exists and is owned by `entry.owner`.
    async fn put_if_owned(&self, key: &str, entry: &Entry, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Delete only if the key is owned by `owner`.
    async fn delete_if_owned(&self, key: &str, owner: &str) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Bound a store call so one slow round-trip cannot stall a tick.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
