use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pkg_types::config::LeaseConfig;
use pkg_types::node::{HeartbeatRecord, Instance, NodeStatus};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::keys::KeySpace;
use crate::store::{Entry, KvStore, StoreError, with_timeout};

/// Instances with an unexpired heartbeat, keyed by ID in sorted order.
///
/// A heartbeat whose payload cannot be decoded still counts as live, with an
/// unknown status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSet {
    members: BTreeMap<String, Option<NodeStatus>>,
}

impl LiveSet {
    pub fn ids(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.members.contains_key(instance_id)
    }

    pub fn status(&self, instance_id: &str) -> Option<NodeStatus> {
        self.members.get(instance_id).copied().flatten()
    }

    pub fn is_online(&self, instance_id: &str) -> bool {
        self.status(instance_id) == Some(NodeStatus::Online)
    }

    pub fn insert(&mut self, instance_id: &str, status: Option<NodeStatus>) {
        self.members.insert(instance_id.to_string(), status);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<NodeStatus>)> {
        self.members.iter().map(|(id, s)| (id.as_str(), *s))
    }
}

impl FromIterator<(String, Option<NodeStatus>)> for LiveSet {
    fn from_iter<I: IntoIterator<Item = (String, Option<NodeStatus>)>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}

/// Heartbeat publisher and live-set reader for one instance.
///
/// The instance reports `init` until the warmup period has passed since this
/// tracker was created, then `online`.
pub struct Membership {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    instance: Instance,
    heartbeat_ttl: Duration,
    op_timeout: Duration,
    warmup: Duration,
    started: Instant,
}

impl Membership {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: KeySpace,
        instance: Instance,
        config: &LeaseConfig,
    ) -> Self {
        Self {
            store,
            keys,
            instance,
            heartbeat_ttl: config.heartbeat_ttl,
            op_timeout: config.store_op_timeout,
            warmup: config.warmup,
            started: Instant::now(),
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn status(&self) -> NodeStatus {
        if self.started.elapsed() >= self.warmup {
            NodeStatus::Online
        } else {
            NodeStatus::Init
        }
    }

    /// Write this instance's heartbeat with the heartbeat TTL.
    pub async fn beat(&self) -> Result<NodeStatus, StoreError> {
        let status = self.status();
        let record = HeartbeatRecord {
            instance_id: self.instance.id.clone(),
            status,
            started_at: self.instance.started_at,
            last_seen_at: Utc::now(),
        };
        let entry = Entry::new(self.instance.id.clone(), serde_json::to_string(&record)?);
        let key = self.keys.heartbeat(&self.instance.id);
        with_timeout(
            self.op_timeout,
            self.store.put(&key, &entry, Some(self.heartbeat_ttl)),
        )
        .await?;
        Ok(status)
    }

    /// Full heartbeat records of every live instance, sorted by ID.
    pub async fn heartbeats(&self) -> Result<Vec<HeartbeatRecord>, StoreError> {
        let prefix = self.keys.heartbeat_prefix();
        let entries = with_timeout(self.op_timeout, self.store.scan_prefix(&prefix)).await?;
        let mut records: Vec<HeartbeatRecord> = entries
            .into_iter()
            .filter_map(|(_, entry)| serde_json::from_str(&entry.data).ok())
            .collect();
        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(records)
    }

    pub async fn live_set(&self) -> Result<LiveSet, StoreError> {
        let prefix = self.keys.heartbeat_prefix();
        let entries = with_timeout(self.op_timeout, self.store.scan_prefix(&prefix)).await?;
        let mut set = LiveSet::default();
        for (key, entry) in entries {
            let Some(id) = key.strip_prefix(&prefix) else {
                continue;
            };
            if id.is_empty() {
                continue;
            }
            let status = match serde_json::from_str::<HeartbeatRecord>(&entry.data) {
                Ok(record) => Some(record.status),
                Err(e) => {
                    warn!("Unreadable heartbeat for {}: {}", id, e);
                    None
                }
            };
            set.members.insert(id.to_string(), status);
        }
        Ok(set)
    }

    /// IDs of every live instance, sorted.
    pub async fn live_instances(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.live_set().await?.ids())
    }

    /// Remove this instance's heartbeat so peers drop it immediately.
    pub async fn leave(&self) -> Result<(), StoreError> {
        let key = self.keys.heartbeat(&self.instance.id);
        let removed = with_timeout(
            self.op_timeout,
            self.store.delete_if_owned(&key, &self.instance.id),
        )
        .await?;
        debug!(
            "Membership: {} left the fleet (heartbeat removed={})",
            self.instance.id, removed
        );
        Ok(())
    }
}
