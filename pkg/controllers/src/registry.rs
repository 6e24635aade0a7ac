use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pkg_state::store::with_timeout;
use pkg_state::{Entry, KeySpace, KvStore};
use pkg_types::session::Session;
use tokio::sync::RwLock;
use tracing::warn;

/// Source of the sessions the fleet should be polling.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn list_sessions(&self) -> anyhow::Result<Vec<Session>>;
}

/// Fixed in-memory session list, editable at runtime.
#[derive(Default)]
pub struct StaticRegistry {
    sessions: RwLock<Vec<Session>>,
}

impl StaticRegistry {
    pub fn new(sessions: Vec<Session>) -> Self {
        Self {
            sessions: RwLock::new(sessions),
        }
    }

    pub async fn upsert(&self, session: Session) {
        let mut sessions = self.sessions.write().await;
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => sessions.push(session),
        }
    }

    pub async fn remove(&self, session_id: &str) {
        self.sessions.write().await.retain(|s| s.id != session_id);
    }

    pub async fn set_paused(&self, session_id: &str, paused: bool) {
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.iter_mut().find(|s| s.id == session_id) {
            s.is_paused = paused;
        }
    }
}

#[async_trait]
impl SessionRegistry for StaticRegistry {
    async fn list_sessions(&self) -> anyhow::Result<Vec<Session>> {
        Ok(self.sessions.read().await.clone())
    }
}

/// Sessions stored as JSON under `session:<id>` in the shared store, so every
/// instance sees the same list.
pub struct StoreSessionRegistry {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    op_timeout: Duration,
}

const REGISTRY_WRITER: &str = "registry";

impl StoreSessionRegistry {
    pub fn new(store: Arc<dyn KvStore>, keys: KeySpace, op_timeout: Duration) -> Self {
        Self {
            store,
            keys,
            op_timeout,
        }
    }

    pub async fn put_session(&self, session: &Session) -> anyhow::Result<()> {
        let entry = Entry::new(REGISTRY_WRITER, serde_json::to_string(session)?);
        let key = self.keys.session(&session.id);
        with_timeout(self.op_timeout, self.store.put(&key, &entry, None)).await?;
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str) -> anyhow::Result<()> {
        let key = self.keys.session(session_id);
        with_timeout(self.op_timeout, self.store.delete(&key)).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionRegistry for StoreSessionRegistry {
    async fn list_sessions(&self) -> anyhow::Result<Vec<Session>> {
        let prefix = self.keys.session_prefix();
        let entries = with_timeout(self.op_timeout, self.store.scan_prefix(&prefix)).await?;
        let mut sessions = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            match serde_json::from_str::<Session>(&entry.data) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Skipping unreadable session record {}: {}", key, e),
            }
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_state::MemoryStore;

    #[tokio::test]
    async fn test_static_registry_edits() {
        let registry = StaticRegistry::new(vec![Session::new("s1", "http://a")]);
        registry.upsert(Session::new("s2", "http://b")).await;
        registry.set_paused("s1", true).await;

        let sessions = registry.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().find(|s| s.id == "s1").unwrap().is_paused);

        registry.remove("s1").await;
        let sessions = registry.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "s2");
    }

    #[tokio::test]
    async fn test_store_registry_round_trip() {
        let store = MemoryStore::new();
        let registry = StoreSessionRegistry::new(
            Arc::new(store.clone()),
            KeySpace::default(),
            Duration::from_secs(1),
        );
        registry.put_session(&Session::new("s1", "http://a")).await.unwrap();
        registry.put_session(&Session::new("s2", "http://b")).await.unwrap();
        store
            .put("session:broken", &Entry::new("registry", "{"), None)
            .await
            .unwrap();

        let mut ids: Vec<String> = registry
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["s1", "s2"]);

        registry.delete_session("s1").await.unwrap();
        assert_eq!(registry.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_registry_propagates_store_errors() {
        let store = MemoryStore::new();
        let registry = StoreSessionRegistry::new(
            Arc::new(store.clone()),
            KeySpace::default(),
            Duration::from_secs(1),
        );
        store.set_unavailable(true);
        assert!(registry.list_sessions().await.is_err());
    }
}
