use std::future::Future;
use std::time::Duration;

use axum::{Router, middleware, routing::get};
use pkg_controllers::ShutdownReport;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::AppState;
use crate::handlers::{fleet, health};
use crate::request_id::request_id_middleware;

pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/api/v1/fleet", get(fleet::fleet_status))
        .route("/api/v1/nodes", get(fleet::list_nodes));

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/metrics", get(health::metrics))
        .merge(api_routes)
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Serve until `shutdown` resolves or the server fails, then shut down in
/// order: the coordinator first (ticks stop, `/healthz` answers 503, leases
/// are released), then HTTP, whose open connections get at most `http_grace`.
pub async fn run<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: F,
    http_grace: Duration,
) -> anyhow::Result<ShutdownReport>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Starting API server on {}", listener.local_addr()?);
    let coordinator = state.coordinator.clone();
    let (http_stop_tx, http_stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async {
                let _ = http_stop_rx.await;
            })
            .await
    });

    let early_exit = tokio::select! {
        _ = shutdown => None,
        exit = &mut server => Some(exit),
    };
    if early_exit.is_some() {
        warn!("API server exited before shutdown was requested");
    }

    let report = coordinator.stop().await;
    info!(
        "Coordinator stopped in {:?}: {} pollers stopped, {} leases released, {} release failures, left fleet: {}, timed out: {}",
        report.elapsed,
        report.pollers_stopped,
        report.released.len(),
        report.release_failures.len(),
        report.left_fleet,
        report.timed_out
    );

    let _ = http_stop_tx.send(());
    let exit = match early_exit {
        Some(exit) => exit,
        None => match tokio::time::timeout(http_grace, &mut server).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(
                    "API server did not drain within {:?}, dropping open connections",
                    http_grace
                );
                server.abort();
                Ok(Ok(()))
            }
        },
    };
    match exit {
        Ok(Ok(())) => info!("API server stopped"),
        Ok(Err(e)) => return Err(anyhow::anyhow!("API server failed: {}", e)),
        Err(e) => return Err(anyhow::anyhow!("API server task failed: {}", e)),
    }
    Ok(report)
}
