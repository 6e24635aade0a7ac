//! Filesystem path constants.

/// Default config file path for the API server.
pub const DEFAULT_SERVER_CONFIG: &str = "/etc/commander/config.yaml";

/// Default data directory for the SlateDB-backed store (single-host mode).
pub const DEFAULT_DATA_DIR: &str = "/tmp/commander-data";
