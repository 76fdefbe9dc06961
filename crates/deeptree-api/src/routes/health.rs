use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::state::{AppState, CapacityReport};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    capacity: CapacityReport,
}

pub fn health_router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        capacity: state.capacity(),
    })
}
