//! Lease / heartbeat timing defaults.
//!
//! Renewal must happen well inside the TTL: the reconciliation tick is a
//! third of the TTL so one missed tick never lets a healthy lease lapse.

/// How long a session lease is valid without renewal, in seconds.
pub const LEASE_TTL_SECS: u64 = 15;

/// How long a heartbeat record lives without refresh, in seconds.
pub const HEARTBEAT_TTL_SECS: u64 = 15;

/// Reconciliation tick (heartbeat + renew + rebalance), in seconds.
pub const TICK_INTERVAL_SECS: u64 = 5;

/// Upper bound for a single store round-trip, in milliseconds.
pub const STORE_OP_TIMEOUT_MS: u64 = 2000;

/// Upper bound for one lease release during shutdown, in milliseconds.
pub const RELEASE_TIMEOUT_MS: u64 = 1000;

/// How long to wait for a poller task to acknowledge cancellation, in milliseconds.
pub const POLLER_STOP_TIMEOUT_MS: u64 = 2000;

/// Total shutdown budget before the process exits anyway, in seconds.
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// Time an instance stays in `init` before it starts acquiring leases, in seconds.
pub const WARMUP_SECS: u64 = 10;
