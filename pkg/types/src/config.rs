use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use pkg_constants::lease::{
    HEARTBEAT_TTL_SECS, LEASE_TTL_SECS, POLLER_STOP_TIMEOUT_MS, RELEASE_TIMEOUT_MS,
    SHUTDOWN_GRACE_SECS, STORE_OP_TIMEOUT_MS, TICK_INTERVAL_SECS, WARMUP_SECS,
};

/// Shared store backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process only. A fleet of one.
    #[default]
    Memory,
    Redis,
    Slatedb,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            "slatedb" => Ok(StoreBackend::Slatedb),
            other => Err(format!(
                "unknown store backend '{}' (expected memory, redis or slatedb)",
                other
            )),
        }
    }
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::Redis => write!(f, "redis"),
            StoreBackend::Slatedb => write!(f, "slatedb"),
        }
    }
}

/// API server configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// port: 8080
/// node-name: api-1
/// store:
///   backend: redis
///   redis-url: redis://redis:6379
///   key-prefix: "commander:"
/// lease:
///   lease-ttl-secs: 15
///   tick-interval-secs: 5
///   shutdown-grace-secs: 10
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfigFile {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, alias = "node-name")]
    pub node_name: Option<String>,
    #[serde(default, alias = "log-format")]
    pub log_format: Option<String>,
    #[serde(default)]
    pub store: StoreConfigFile,
    #[serde(default)]
    pub lease: LeaseConfigFile,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfigFile {
    #[serde(default)]
    pub backend: Option<StoreBackend>,
    #[serde(default, alias = "redis-url")]
    pub redis_url: Option<String>,
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    /// Prepended to every key so several fleets can share one store.
    #[serde(default, alias = "key-prefix")]
    pub key_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseConfigFile {
    #[serde(default, alias = "lease-ttl-secs")]
    pub lease_ttl_secs: Option<u64>,
    #[serde(default, alias = "heartbeat-ttl-secs")]
    pub heartbeat_ttl_secs: Option<u64>,
    #[serde(default, alias = "tick-interval-secs")]
    pub tick_interval_secs: Option<u64>,
    #[serde(default, alias = "store-op-timeout-ms")]
    pub store_op_timeout_ms: Option<u64>,
    #[serde(default, alias = "release-timeout-ms")]
    pub release_timeout_ms: Option<u64>,
    #[serde(default, alias = "poller-stop-timeout-ms")]
    pub poller_stop_timeout_ms: Option<u64>,
    #[serde(default, alias = "shutdown-grace-secs")]
    pub shutdown_grace_secs: Option<u64>,
    #[serde(default, alias = "warmup-secs")]
    pub warmup_secs: Option<u64>,
}

/// Runtime timing parameters of the lease coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    pub lease_ttl: Duration,
    pub heartbeat_ttl: Duration,
    /// One reconciliation tick: heartbeat, renew, acquire, rebalance.
    pub tick_interval: Duration,
    /// Upper bound on any single store call.
    pub store_op_timeout: Duration,
    /// Upper bound on one release during shutdown.
    pub release_timeout: Duration,
    pub poller_stop_timeout: Duration,
    pub shutdown_grace: Duration,
    pub warmup: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
            heartbeat_ttl: Duration::from_secs(HEARTBEAT_TTL_SECS),
            tick_interval: Duration::from_secs(TICK_INTERVAL_SECS),
            store_op_timeout: Duration::from_millis(STORE_OP_TIMEOUT_MS),
            release_timeout: Duration::from_millis(RELEASE_TIMEOUT_MS),
            poller_stop_timeout: Duration::from_millis(POLLER_STOP_TIMEOUT_MS),
            shutdown_grace: Duration::from_secs(SHUTDOWN_GRACE_SECS),
            warmup: Duration::from_secs(WARMUP_SECS),
        }
    }
}

impl LeaseConfig {
    /// Merge file values over the built-in defaults.
    pub fn from_file(file: &LeaseConfigFile) -> Self {
        let d = Self::default();
        let secs = |v: Option<u64>, default: Duration| v.map(Duration::from_secs).unwrap_or(default);
        let millis =
            |v: Option<u64>, default: Duration| v.map(Duration::from_millis).unwrap_or(default);
        Self {
            lease_ttl: secs(file.lease_ttl_secs, d.lease_ttl),
            heartbeat_ttl: secs(file.heartbeat_ttl_secs, d.heartbeat_ttl),
            tick_interval: secs(file.tick_interval_secs, d.tick_interval),
            store_op_timeout: millis(file.store_op_timeout_ms, d.store_op_timeout),
            release_timeout: millis(file.release_timeout_ms, d.release_timeout),
            poller_stop_timeout: millis(file.poller_stop_timeout_ms, d.poller_stop_timeout),
            shutdown_grace: secs(file.shutdown_grace_secs, d.shutdown_grace),
            warmup: secs(file.warmup_secs, d.warmup),
        }
    }

    /// Reject timings that would let a healthy lease or heartbeat lapse
    /// between two ticks, or let one store call stall a whole tick.
    pub fn validate(&self) -> anyhow::Result<()> {
        let named = [
            ("lease_ttl", self.lease_ttl),
            ("heartbeat_ttl", self.heartbeat_ttl),
            ("tick_interval", self.tick_interval),
            ("store_op_timeout", self.store_op_timeout),
            ("release_timeout", self.release_timeout),
            ("poller_stop_timeout", self.poller_stop_timeout),
            ("shutdown_grace", self.shutdown_grace),
        ];
        for (name, value) in named {
            if value.is_zero() {
                bail!("{} must be greater than zero", name);
            }
        }
        // A TTL of at least two ticks survives one delayed or failed tick.
        for (name, ttl) in [
            ("lease_ttl", self.lease_ttl),
            ("heartbeat_ttl", self.heartbeat_ttl),
        ] {
            if ttl < self.tick_interval * 2 {
                bail!(
                    "{} ({:?}) must be at least twice tick_interval ({:?})",
                    name,
                    ttl,
                    self.tick_interval
                );
            }
        }
        if self.store_op_timeout >= self.tick_interval {
            bail!(
                "store_op_timeout ({:?}) must be shorter than tick_interval ({:?})",
                self.store_op_timeout,
                self.tick_interval
            );
        }
        Ok(())
    }
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = LeaseConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.tick_interval * 2 < cfg.lease_ttl);
    }

    #[test]
    fn test_tick_must_be_shorter_than_ttl() {
        let cfg = LeaseConfig {
            tick_interval: Duration::from_secs(15),
            ..LeaseConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_ttls_must_cover_two_ticks() {
        let just_below = LeaseConfig {
            tick_interval: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(9),
            ..LeaseConfig::default()
        };
        assert!(just_below.validate().is_err());

        let short_heartbeat = LeaseConfig {
            heartbeat_ttl: Duration::from_secs(9),
            ..LeaseConfig::default()
        };
        assert!(short_heartbeat.validate().is_err());

        let exactly_two = LeaseConfig {
            lease_ttl: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(10),
            ..LeaseConfig::default()
        };
        assert!(exactly_two.validate().is_ok());
    }

    #[test]
    fn test_store_timeout_must_fit_in_tick() {
        let cfg = LeaseConfig {
            store_op_timeout: Duration::from_secs(5),
            ..LeaseConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_warmup_is_allowed() {
        let cfg = LeaseConfig {
            warmup: Duration::ZERO,
            ..LeaseConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_with_kebab_aliases() {
        let yaml = r#"
port: 9000
node-name: api-2
store:
  backend: redis
  redis-url: redis://cache:6379
lease:
  lease-ttl-secs: 30
  tick-interval-secs: 10
"#;
        let file: ServerConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.port, Some(9000));
        assert_eq!(file.node_name.as_deref(), Some("api-2"));
        assert_eq!(file.store.backend, Some(StoreBackend::Redis));

        let cfg = LeaseConfig::from_file(&file.lease);
        assert_eq!(cfg.lease_ttl, Duration::from_secs(30));
        assert_eq!(cfg.tick_interval, Duration::from_secs(10));
        assert_eq!(cfg.heartbeat_ttl, Duration::from_secs(HEARTBEAT_TTL_SECS));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let file: ServerConfigFile = load_config_file("/nonexistent/commander.yaml").unwrap();
        assert!(file.port.is_none());
        assert!(file.store.backend.is_none());
    }

    #[test]
    fn test_store_backend_from_str() {
        assert_eq!("Redis".parse::<StoreBackend>(), Ok(StoreBackend::Redis));
        assert!("etcd".parse::<StoreBackend>().is_err());
    }
}
