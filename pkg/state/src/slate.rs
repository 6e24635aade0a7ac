use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use slatedb::Db;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::path::Path;
use tokio::sync::Mutex;
use tracing::info;

use crate::store::{Entry, KvStore, StoreError};

/// On-disk envelope. SlateDB has no native TTL, so expiry is stored as an
/// absolute wall-clock deadline and checked on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Stored {
    owner: String,
    data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<i64>,
}

impl Stored {
    fn new(entry: &Entry, ttl: Option<Duration>) -> Self {
        Self {
            owner: entry.owner.clone(),
            data: entry.data.clone(),
            expires_at_ms: ttl.map(|ttl| Utc::now().timestamp_millis() + ttl.as_millis() as i64),
        }
    }

    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_none_or(|t| now_ms < t)
    }

    fn into_entry(self) -> Entry {
        Entry {
            owner: self.owner,
            data: self.data,
        }
    }
}

fn backend(op: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("SlateDB {} failed: {}", op, e))
}

/// Single-host store backed by SlateDB on a local filesystem.
///
/// Conditional writes are serialized through an in-process lock, so the
/// store is only safe to share between coordinators in the same process.
/// Multi-host fleets should use Redis.
#[derive(Clone)]
pub struct SlateStore {
    db: Db,
    cas: Arc<Mutex<()>>,
}

impl SlateStore {
    /// Open (or create) a store rooted at `path` on the local filesystem.
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        info!("Opening SlateDB store at {}", path);

        std::fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory {}: {}", path, e))?;

        let object_store = Arc::new(
            LocalFileSystem::new_with_prefix(path)
                .map_err(|e| anyhow::anyhow!("Failed to create local object store: {}", e))?,
        );
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open SlateDB: {}", e))?;
        Ok(Self {
            db,
            cas: Arc::new(Mutex::new(())),
        })
    }

    /// Flush and close the underlying database.
    pub async fn close(self) -> anyhow::Result<()> {
        info!("Closing SlateDB store");
        self.db
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB close failed: {}", e))
    }

    async fn read(&self, key: &str) -> Result<Option<Stored>, StoreError> {
        let bytes = match self.db.get(key.as_bytes()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) => return Err(backend("get", e)),
        };
        let stored: Stored = serde_json::from_slice(&bytes)?;
        if stored.is_live(Utc::now().timestamp_millis()) {
            Ok(Some(stored))
        } else {
            Ok(None)
        }
    }

    async fn write(&self, key: &str, stored: &Stored) -> Result<(), StoreError> {
        let value = serde_json::to_vec(stored)?;
        self.db
            .put(key.as_bytes(), &value)
            .await
            .map(|_| ())
            .map_err(|e| backend("put", e))
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.db
            .delete(key.as_bytes())
            .await
            .map(|_| ())
            .map_err(|e| backend("delete", e))
    }
}

#[async_trait]
impl KvStore for SlateStore {
    fn name(&self) -> &'static str {
        "slatedb"
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        Ok(self.read(key).await?.map(Stored::into_entry))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Entry)>, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut results = Vec::new();
        let mut iter = self
            .db
            .scan_prefix(prefix.as_bytes())
            .await
            .map_err(|e| backend("scan_prefix", e))?;

        while let Some(kv) = iter.next().await.map_err(|e| backend("scan", e))? {
            let key = String::from_utf8_lossy(&kv.key).to_string();
            let stored: Stored = serde_json::from_slice(&kv.value)?;
            if stored.is_live(now_ms) {
                results.push((key, stored.into_entry()));
            }
        }
        Ok(results)
    }

    async fn put(
        &self,
        key: &str,
        entry: &Entry,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let _guard = self.cas.lock().await;
        self.write(key, &Stored::new(entry, ttl)).await
    }

    async fn put_if_vacant_or_owned(
        &self,
        key: &str,
        entry: &Entry,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let _guard = self.cas.lock().await;
        if let Some(current) = self.read(key).await? {
            if current.owner != entry.owner {
                return Ok(false);
            }
        }
        self.write(key, &Stored::new(entry, Some(ttl))).await?;
        Ok(true)
    }

    async fn put_if_owned(
        &self,
        key: &str,
        entry: &Entry,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let _guard = self.cas.lock().await;
        match self.read(key).await? {
            Some(current) if current.owner == entry.owner => {
                self.write(key, &Stored::new(entry, Some(ttl))).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_owned(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let _guard = self.cas.lock().await;
        match self.read(key).await? {
            Some(current) if current.owner == owner => {
                self.remove(key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.cas.lock().await;
        self.remove(key).await
    }
}
