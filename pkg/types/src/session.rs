use serde::{Deserialize, Serialize};

/// A user-managed connection target: one game server to poll.
///
/// Owned by the session CRUD layer; the lease coordinator only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// `host:port` of the game server's HTTP API.
    pub address: String,
    #[serde(default)]
    pub is_paused: bool,
}

impl Session {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            address: address.into(),
            is_paused: false,
        }
    }
}
