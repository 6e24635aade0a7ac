//! Shared store key layout.

/// Key prefix for instance heartbeat records: `node:heartbeat:<instanceID>`.
pub const HEARTBEAT_KEY_PREFIX: &str = "node:heartbeat:";

/// Key prefix for per-session lease records: `lease:<sessionID>`.
pub const LEASE_KEY_PREFIX: &str = "lease:";

/// Key prefix for session definitions read by the store-backed registry.
pub const SESSION_KEY_PREFIX: &str = "session:";

/// Capacity of the in-memory lease event ring buffer.
pub const LEASE_EVENT_LOG_CAPACITY: usize = 256;

/// Capacity of the lease event broadcast channel.
pub const LEASE_EVENT_CHANNEL_CAPACITY: usize = 1024;
