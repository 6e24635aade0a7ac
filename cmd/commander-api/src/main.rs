use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pkg_api::AppState;
use pkg_constants::network::{
    DEFAULT_API_PORT, DEFAULT_POLL_INTERVAL_MS, DEFAULT_POLL_TIMEOUT_MS, DEFAULT_REDIS_URL,
    HTTP_SHUTDOWN_TIMEOUT_SECS,
};
use pkg_constants::paths::{DEFAULT_DATA_DIR, DEFAULT_SERVER_CONFIG};
use pkg_controllers::{HttpPoller, LeaseCoordinator, Reconciler, StoreSessionRegistry};
use pkg_metrics::{LeaseMetrics, MetricsRegistry};
use pkg_state::{KeySpace, KvStore, MemoryStore, RedisStore, SlateStore};
use pkg_types::config::{LeaseConfig, ServerConfigFile, StoreBackend, load_config_file};
use pkg_types::node::Instance;
use pkg_types::validate::validate_id;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "commander-api", about = "Fleet commander API server")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_SERVER_CONFIG)]
    config: String,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Stable instance ID (defaults to hostname + boot time + random suffix)
    #[arg(long)]
    node_name: Option<String>,

    /// Shared store backend: memory, redis or slatedb
    #[arg(long)]
    store: Option<StoreBackend>,

    /// Redis URL for the redis backend
    #[arg(long)]
    redis_url: Option<String>,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Namespace prepended to every store key
    #[arg(long)]
    key_prefix: Option<String>,

    /// Log output format: text or json
    #[arg(long)]
    log_format: Option<String>,
}

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: ServerConfigFile = load_config_file(&cli.config)
        .with_context(|| format!("Failed to load config file {}", cli.config))?;

    // Merge: CLI args > config file > defaults
    let log_format = cli
        .log_format
        .or(file_cfg.log_format)
        .unwrap_or_else(|| "text".to_string());
    init_tracing(&log_format);
    info!("Config file: {}", cli.config);

    let port = cli.port.or(file_cfg.port).unwrap_or(DEFAULT_API_PORT);
    let backend = cli.store.or(file_cfg.store.backend).unwrap_or_default();
    let key_prefix = cli
        .key_prefix
        .or(file_cfg.store.key_prefix)
        .unwrap_or_default();
    let node_name = cli.node_name.or(file_cfg.node_name);

    let lease_config = LeaseConfig::from_file(&file_cfg.lease);
    lease_config
        .validate()
        .context("Invalid lease configuration")?;

    let instance = Instance::generate(node_name.as_deref());
    validate_id(&instance.id).context("Invalid instance id")?;

    info!("Starting commander-api");
    info!("  Instance:  {}", instance.id);
    info!("  Port:      {}", port);
    info!("  Store:     {}", backend);
    info!(
        "  Lease:     ttl={:?} tick={:?} grace={:?}",
        lease_config.lease_ttl, lease_config.tick_interval, lease_config.shutdown_grace
    );

    let mut slate = None;
    let store: Arc<dyn KvStore> = match backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store; leases are not shared with other instances");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis => {
            let url = cli
                .redis_url
                .or(file_cfg.store.redis_url)
                .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
            Arc::new(
                RedisStore::connect(&url)
                    .await
                    .with_context(|| format!("Failed to connect to Redis at {}", url))?,
            )
        }
        StoreBackend::Slatedb => {
            let data_dir = cli
                .data_dir
                .or(file_cfg.store.data_dir)
                .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
            let db = SlateStore::open(&data_dir).await?;
            slate = Some(db.clone());
            Arc::new(db)
        }
    };
    let keys = KeySpace::new(key_prefix);

    let registry = Arc::new(StoreSessionRegistry::new(
        store.clone(),
        keys.clone(),
        lease_config.store_op_timeout,
    ));
    let poller = Arc::new(HttpPoller::new(
        Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
    )?);

    let metrics = Arc::new(MetricsRegistry::new().with_const_label("instance", &instance.id));
    let lease_metrics = LeaseMetrics::register(&metrics);

    let reconciler = Reconciler::new(
        instance,
        store,
        keys,
        registry,
        poller,
        lease_config,
        lease_metrics,
    );
    let coordinator = Arc::new(LeaseCoordinator::new(reconciler));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API server to {}", addr))?;
    coordinator.start().await;

    let state = AppState {
        coordinator,
        metrics,
    };
    // Stops the coordinator (releasing leases) before HTTP, both bounded.
    let served = pkg_api::server::run(
        listener,
        state,
        shutdown_signal(),
        Duration::from_secs(HTTP_SHUTDOWN_TIMEOUT_SECS),
    )
    .await;
    if let Err(e) = &served {
        warn!("API server exited with error: {}", e);
    }

    if let Some(db) = slate {
        db.close().await?;
    }
    served.map(|_| ())
}
