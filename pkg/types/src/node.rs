use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ephemeral identity of one running API process.
///
/// Passed explicitly into every component so several simulated instances can
/// live in one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub started_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            started_at: Utc::now(),
        }
    }

    /// Use `node_name` when configured, otherwise
    /// `<hostname>-<boot unix nanos>-<8 hex chars>`, which is never reused
    /// across restarts.
    pub fn generate(node_name: Option<&str>) -> Self {
        let started_at = Utc::now();
        let id = match node_name.filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => {
                let hostname = nix::unistd::gethostname()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "unknown".to_string());
                let boot = started_at.timestamp_nanos_opt().unwrap_or_default();
                let suffix = Uuid::new_v4().simple().to_string();
                format!("{}-{}-{}", hostname, boot, &suffix[..8])
            }
        };
        Self { id, started_at }
    }
}

/// Self-reported instance status carried in the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Warming up: keeps leases it has, acquires no new ones.
    Init,
    /// Fully participating in acquisition and rebalancing.
    Online,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Init => write!(f, "init"),
            NodeStatus::Online => write!(f, "online"),
        }
    }
}

/// Liveness record stored at `node:heartbeat:<instanceID>`.
/// Expiry of the record is the only liveness signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub instance_id: String,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_uses_node_name() {
        let instance = Instance::generate(Some("api-1"));
        assert_eq!(instance.id, "api-1");
    }

    #[test]
    fn test_generate_is_unique() {
        let a = Instance::generate(None);
        let b = Instance::generate(Some(""));
        assert_ne!(a.id, b.id);
        assert!(!a.id.is_empty());
        assert_eq!(a.id.rsplit('-').next().map(str::len), Some(8));
    }
}
