//! Internal control plane under `/internal/*`.
//!
//! Service-to-service endpoints guarded by the `X-Internal-API-Key`
//! shared secret. Bodies mirror the operator tooling contract: VRAM
//! status and model listing, explicit load/unload/evict, queue stats
//! and purge, and an aggregate health view.

use axum::{
    Json,
    extract::State,
    http::HeaderMap,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use gantry_foundation::engine::EngineAdapter;
use gantry_kernel::model::ModelPriority;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Verify the shared secret header.
pub(crate) fn verify_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = &state.settings.internal_api_key;
    if expected.is_empty() {
        return Err(ApiError::ApiKeyUnconfigured);
    }
    let provided = headers
        .get("x-internal-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::MissingApiKey)?;
    if provided != expected {
        warn!("invalid internal API key provided");
        return Err(ApiError::InvalidApiKey);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct LoadModelRequest {
    pub model_id: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub additional_args: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct UnloadModelRequest {
    pub model_id: String,
    #[serde(default)]
    pub crashed: bool,
}

#[derive(Debug, Deserialize)]
pub struct EvictRequest {
    #[serde(default = "default_priority")]
    pub priority: String,
}

fn default_priority() -> String {
    "NORMAL".into()
}

/// `GET /internal/vram/status`
pub async fn vram_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    verify_api_key(&state, &headers)?;
    let status = state.orchestrator.status();
    Ok(Json(json!({
        "memory": {
            "total_gb": status.memory.total_gb,
            "used_gb": status.memory.used_gb,
            "available_gb": status.memory.available_gb,
            "usage_pct": status.memory.usage_pct,
            "psi": {
                "cpu": status.memory.psi.cpu,
                "memory": status.memory.psi.memory,
                "io": status.memory.psi.io,
            },
        },
        "loaded_models": status.loaded_models,
        "healthy": status.healthy,
    })))
}

/// `GET /internal/vram/models`
pub async fn vram_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    verify_api_key(&state, &headers)?;
    let models: Vec<Value> = state
        .orchestrator
        .registry()
        .snapshot()
        .into_iter()
        .map(|entry| {
            json!({
                "model_id": entry.model_id,
                "backend": entry.backend,
                "vram_size_gb": entry.vram_size_gb,
                "priority": entry.priority,
                "last_accessed": entry.last_accessed_secs,
                "is_external": entry.is_external,
            })
        })
        .collect();
    Ok(Json(json!({ "models": models })))
}

/// `POST /internal/vram/load`
pub async fn vram_load(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LoadModelRequest>,
) -> ApiResult<Json<Value>> {
    verify_api_key(&state, &headers)?;
    info!(model = %request.model_id, "internal API: load model");

    let params = gantry_foundation::engine::GenerateParams {
        temperature: request.temperature,
        ..Default::default()
    };
    let _ = request.additional_args;

    state
        .orchestrator
        .request_load(&request.model_id, &params)
        .await?;

    Ok(Json(json!({
        "status": "success",
        "model_id": request.model_id,
        "message": format!("Model {} loaded successfully", request.model_id),
    })))
}

/// `POST /internal/vram/unload`
pub async fn vram_unload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<UnloadModelRequest>,
) -> ApiResult<Json<Value>> {
    verify_api_key(&state, &headers)?;
    info!(model = %request.model_id, crashed = request.crashed, "internal API: unload model");

    state
        .orchestrator
        .mark_unloaded(
            &request.model_id,
            request.crashed,
            request.crashed.then_some("operator_reported_crash"),
        )
        .await?;

    Ok(Json(json!({ "status": "success", "model_id": request.model_id })))
}

/// `POST /internal/vram/evict`
pub async fn vram_evict(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EvictRequest>,
) -> ApiResult<Json<Value>> {
    verify_api_key(&state, &headers)?;

    let priority = ModelPriority::parse(&request.priority).ok_or_else(|| {
        ApiError::Gantry(gantry_kernel::error::GantryError::InvalidRequest(format!(
            "invalid priority: {}. Must be one of: LOW, NORMAL, HIGH, CRITICAL",
            request.priority
        )))
    })?;

    warn!(priority = %priority, "internal API: emergency eviction requested");
    let outcome = state.orchestrator.emergency_evict(priority).await;

    Ok(Json(json!({
        "status": "success",
        "evicted": outcome.evicted,
        "model_id": outcome.model_id,
        "size_gb": outcome.size_gb,
        "reason": outcome.reason,
    })))
}

/// `GET /internal/vram/available-models`
pub async fn available_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    verify_api_key(&state, &headers)?;

    let models: Vec<Value> = state
        .profile
        .models
        .iter()
        .map(|model| {
            let mut capabilities = Vec::new();
            if model.capabilities.vision {
                capabilities.push("vision");
            }
            if model.capabilities.thinking {
                capabilities.push("thinking");
            }
            if model.capabilities.tools {
                capabilities.push("tools");
            }
            json!({
                "name": model.name,
                "vram_size_gb": model.vram_gb,
                "priority": model.priority,
                "backend": {
                    "type": model.engine.to_string(),
                    "endpoint": model.endpoint,
                },
                "capabilities": capabilities,
            })
        })
        .collect();

    Ok(Json(json!({ "models": models })))
}

/// `GET /internal/queue/stats`
pub async fn queue_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    verify_api_key(&state, &headers)?;
    Ok(Json(json!({
        "queue_size": state.queue.size(),
        "in_flight": state.queue.in_flight_snapshot().len(),
        "is_full": state.queue.is_full(),
        "max_size": state.queue.capacity(),
    })))
}

/// `POST /internal/queue/purge`
pub async fn queue_purge(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    verify_api_key(&state, &headers)?;
    let purged_count = state.queue.purge();
    warn!(purged = purged_count, "queue purged via internal API");
    Ok(Json(json!({
        "status": "success",
        "purged_count": purged_count,
    })))
}

/// `GET /internal/health`
pub async fn system_health(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    verify_api_key(&state, &headers)?;

    let status = state.orchestrator.status();

    // Engine reachability: an engine that answers list_loaded is up.
    let mut engines = serde_json::Map::new();
    for (kind, adapter) in state.engines.iter() {
        let healthy = adapter.list_loaded().await.is_ok();
        engines.insert(
            kind.to_string(),
            json!({
                "healthy": healthy,
                "message": if healthy { "Connected" } else { "Unreachable" },
            }),
        );
    }

    Ok(Json(json!({
        "services": {
            "gateway": { "healthy": true, "message": "Gateway running" },
            "engines": engines,
            "vram": {
                "healthy": status.healthy,
                "usage_pct": status.memory.usage_pct,
                "available_gb": status.memory.available_gb,
                "loaded_models": status.loaded_models.len(),
            },
        },
        "queue": {
            "size": state.queue.size(),
            "is_full": state.queue.is_full(),
        },
    })))
}
