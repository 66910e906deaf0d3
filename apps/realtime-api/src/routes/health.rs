use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub instance_id: String,
    /// `connected`, or `degraded` while only local subscribers are served.
    pub backplane: String,
    pub connections: usize,
    pub active_rooms: usize,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse),
    ),
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let gateway = &state.gateway;
    Json(HealthResponse {
        status: "ok".to_string(),
        instance_id: gateway.instance_id().to_string(),
        backplane: if gateway.backplane_connected() {
            "connected"
        } else {
            "degraded"
        }
        .to_string(),
        connections: gateway.connection_count(),
        active_rooms: gateway.active_rooms().len(),
    })
}
