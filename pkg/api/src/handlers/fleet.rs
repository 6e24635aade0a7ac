use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::{debug, error};

use crate::AppState;

/// GET /api/v1/fleet - this instance's view of the fleet and its leases.
pub async fn fleet_status(State(state): State<AppState>) -> impl IntoResponse {
    debug!("Serving fleet status request");
    let status = state.coordinator.fleet_status().await;
    (StatusCode::OK, Json(status)).into_response()
}

/// GET /api/v1/nodes - live instances and the sessions each holds, read
/// from the shared store.
pub async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    debug!("Serving node list request");
    match state.coordinator.nodes().await {
        Ok(nodes) => (StatusCode::OK, Json(nodes)).into_response(),
        Err(e) => {
            error!("Failed to list nodes: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "Failed to read fleet state").into_response()
        }
    }
}
