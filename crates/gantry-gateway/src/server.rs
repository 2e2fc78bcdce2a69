//! Router assembly and the serve loop.

use axum::{
    Router,
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers::{chat_ws, health, internal, metrics};
use crate::state::AppState;

/// Build the full gateway router.
pub fn build_router(state: AppState) -> Router {
    let internal_routes = Router::new()
        .route("/vram/status", get(internal::vram_status))
        .route("/vram/models", get(internal::vram_models))
        .route("/vram/load", post(internal::vram_load))
        .route("/vram/unload", post(internal::vram_unload))
        .route("/vram/evict", post(internal::vram_evict))
        .route("/vram/available-models", get(internal::available_models))
        .route("/queue/stats", get(internal::queue_stats))
        .route("/queue/purge", post(internal::queue_purge))
        .route("/metrics/query", get(metrics::metrics_query))
        .route("/metrics/series", get(metrics::metrics_series))
        .route("/health", get(internal::system_health));

    Router::new()
        .route("/health", get(health::health))
        .route("/ws/chat/{conversation_id}", get(chat_ws::chat_websocket))
        .nest("/internal", internal_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` fires.
pub async fn serve(
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let addr = format!("{}:{}", state.settings.host, state.settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gateway listening");

    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
