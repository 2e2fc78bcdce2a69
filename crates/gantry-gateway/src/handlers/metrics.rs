//! Metrics query endpoint over the time-series store.

use axum::{
    Json,
    extract::{Query, State},
    http::HeaderMap,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use gantry_monitoring::aggregate::{BucketWidth, aggregate};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub series: String,
    /// Lookback window in minutes; default one hour.
    #[serde(default = "default_minutes")]
    pub minutes: i64,
    /// Bucket width: 5s | 1m | 5m | 1h; default 1m.
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

fn default_minutes() -> i64 {
    60
}

fn default_bucket() -> String {
    "1m".into()
}

/// `GET /internal/metrics/query`
pub async fn metrics_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<MetricsQuery>,
) -> ApiResult<Json<Value>> {
    super::internal::verify_api_key(&state, &headers)?;

    let bucket = BucketWidth::parse(&query.bucket).ok_or_else(|| {
        ApiError::Gantry(gantry_kernel::error::GantryError::InvalidRequest(format!(
            "invalid bucket width: {}",
            query.bucket
        )))
    })?;

    let to = Utc::now();
    let from = to - Duration::minutes(query.minutes.clamp(1, 48 * 60));
    let samples = state.metrics.query(&query.series, from, to);
    let aggregations = aggregate(&samples, bucket);

    Ok(Json(json!({
        "series": query.series,
        "from": from.to_rfc3339(),
        "to": to.to_rfc3339(),
        "bucket": query.bucket,
        "sample_count": samples.len(),
        "buckets": aggregations,
    })))
}

/// `GET /internal/metrics/series`
pub async fn metrics_series(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    super::internal::verify_api_key(&state, &headers)?;
    Ok(Json(json!({ "series": state.metrics.series_names() })))
}
