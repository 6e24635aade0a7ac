pub mod handlers;
pub mod request_id;
pub mod server;

use std::sync::Arc;

use pkg_controllers::LeaseCoordinator;
use pkg_metrics::MetricsRegistry;

/// Shared application state injected into all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<LeaseCoordinator>,
    pub metrics: Arc<MetricsRegistry>,
}
