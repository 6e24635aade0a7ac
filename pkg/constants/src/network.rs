//! Network-related constants.

/// Default port for the commander API server.
pub const DEFAULT_API_PORT: u16 = 8080;

/// Default Redis endpoint for the shared lease store.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Interval between two polls of a session's remote API, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// Per-request timeout for a session poll, in milliseconds.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1500;

/// How long open HTTP connections may drain once the coordinator has stopped.
pub const HTTP_SHUTDOWN_TIMEOUT_SECS: u64 = 5;
