use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A per-session polling lease.
/// Stored at `lease:<sessionID>` in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// The instance holding this lease
    pub owner_id: String,
    /// When the lease was first acquired
    pub acquired_at: DateTime<Utc>,
    /// When the lease was last renewed
    pub last_renewed_at: DateTime<Utc>,
}

impl LeaseRecord {
    /// A fresh record for a lease acquired right now.
    pub fn new(owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            owner_id: owner_id.into(),
            acquired_at: now,
            last_renewed_at: now,
        }
    }

    /// Same record with `last_renewed_at` moved to now.
    pub fn renewed(&self) -> Self {
        Self {
            last_renewed_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// This instance's view of a session lease.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    /// Not resolved yet (first tick after startup).
    #[default]
    Unknown,
    /// This instance holds the lease and may poll.
    Owned,
    /// Another live instance holds the lease.
    Other,
    /// Ownership is unclear: renewal failed, lost a race, or the holder is gone.
    /// Never a license to poll.
    Uncertain,
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseState::Unknown => write!(f, "unknown"),
            LeaseState::Owned => write!(f, "owned"),
            LeaseState::Other => write!(f, "other"),
            LeaseState::Uncertain => write!(f, "uncertain"),
        }
    }
}

/// Local, derived lease view for one session. Recomputed every reconciliation
/// tick and never written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLease {
    pub session_id: String,
    pub session_name: String,
    /// Holder according to the store at the last tick.
    pub owner_id: Option<String>,
    /// Rendezvous choice over the live set at the last tick.
    pub preferred_owner_id: Option<String>,
    pub state: LeaseState,
    pub acquired_at: Option<DateTime<Utc>>,
    pub last_renewed_at: Option<DateTime<Utc>>,
    pub uncertain_since: Option<DateTime<Utc>>,
}

impl SessionLease {
    pub fn new(session_id: impl Into<String>, session_name: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            session_name: session_name.into(),
            owner_id: None,
            preferred_owner_id: None,
            state: LeaseState::Unknown,
            acquired_at: None,
            last_renewed_at: None,
            uncertain_since: None,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.state == LeaseState::Owned
    }
}

/// Kind of lease lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseEventKind {
    Acquired,
    AcquireFailed,
    Renewed,
    RenewFailed,
    Released,
    Expired,
    TakenOver,
}

impl std::fmt::Display for LeaseEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LeaseEventKind::Acquired => "acquired",
            LeaseEventKind::AcquireFailed => "acquire_failed",
            LeaseEventKind::Renewed => "renewed",
            LeaseEventKind::RenewFailed => "renew_failed",
            LeaseEventKind::Released => "released",
            LeaseEventKind::Expired => "expired",
            LeaseEventKind::TakenOver => "taken_over",
        };
        write!(f, "{}", s)
    }
}

/// A lease lifecycle event, kept in the in-memory event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseEvent {
    pub seq: u64,
    pub kind: LeaseEventKind,
    pub session_id: String,
    pub instance_id: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
