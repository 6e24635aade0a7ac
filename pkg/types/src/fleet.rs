use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lease::{LeaseEvent, SessionLease};
use crate::node::NodeStatus;

/// One live instance as seen from the calling instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub instance_id: String,
    pub is_this_instance: bool,
    /// Self-reported status from the heartbeat, if it could be read.
    pub status: Option<NodeStatus>,
    /// Sessions whose lease this instance holds in the store.
    pub owned_sessions: Vec<String>,
}

/// Fleet status snapshot for the operational/debug endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    pub this_instance_id: String,
    pub started_at: DateTime<Utc>,
    pub shutting_down: bool,
    pub live_instances: Vec<NodeInfo>,
    pub sessions: Vec<SessionLease>,
    pub recent_events: Vec<LeaseEvent>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

/// Response of the nodes endpoint: every live instance with the sessions it
/// holds according to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodesResponse {
    pub this_instance_id: String,
    pub live_nodes: Vec<NodeInfo>,
    pub timestamp: DateTime<Utc>,
}
