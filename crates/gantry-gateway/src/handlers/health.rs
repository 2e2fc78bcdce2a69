//! Public liveness endpoint.

use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::state::AppState;

/// `GET /health`: unauthenticated liveness probe.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "profile": state.profile.name,
        "queue_size": state.queue.size(),
    }))
}
