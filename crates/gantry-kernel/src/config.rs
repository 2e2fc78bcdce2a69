//! Runtime settings, layered from defaults and `GANTRY_*` environment
//! variables via the `config` crate.

use config::{Config, Environment};
use serde::{Deserialize, Serialize};

use crate::error::{GantryError, GantryResult};

/// Application configuration.
///
/// All durations are seconds. Profile-level values (model catalogue,
/// VRAM limits, route bindings) live in [`crate::profile::Profile`],
/// not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Server
    pub host: String,
    pub port: u16,
    /// Shared secret for `/internal/*`; requests without a matching
    /// `X-Internal-API-Key` header are rejected.
    pub internal_api_key: String,
    /// Name of the profile selected at startup.
    pub profile: String,

    // Queue
    pub max_queue_size: usize,
    /// Queue size at which Normal-tier requests start being rejected.
    pub queue_watermark: usize,
    pub max_retries: u32,
    pub visibility_timeout_secs: u64,
    pub image_visibility_timeout_secs: u64,
    pub visibility_check_interval_secs: u64,

    // Workers
    pub worker_count: usize,
    pub shutdown_grace_secs: u64,

    // Engine calls
    pub request_timeout_secs: u64,
    pub image_request_timeout_secs: u64,

    // Orchestrator
    pub crash_threshold: usize,
    pub crash_window_secs: u64,
    pub reconcile_interval_secs: u64,

    // Budgets and context
    pub default_weekly_budget: i64,
    pub default_temperature: f32,
    pub summarize_threshold_tokens: u32,
    /// Messages fetched per context load.
    pub context_window_messages: usize,
    /// Messages kept verbatim after summarisation.
    pub summarize_keep_last: usize,

    // Streaming
    /// Per-handle send timeout before a saturated connection is dropped.
    pub mux_send_timeout_secs: u64,

    // Metrics
    pub metrics_sample_interval_secs: u64,
    pub metrics_ttl_hours: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            internal_api_key: String::new(),
            profile: "balanced".into(),

            max_queue_size: 50,
            queue_watermark: 40,
            max_retries: 3,
            visibility_timeout_secs: 300,
            image_visibility_timeout_secs: 900,
            visibility_check_interval_secs: 10,

            worker_count: 1,
            shutdown_grace_secs: 30,

            request_timeout_secs: 300,
            image_request_timeout_secs: 900,

            crash_threshold: 2,
            crash_window_secs: 300,
            reconcile_interval_secs: 60,

            default_weekly_budget: 100_000,
            default_temperature: 0.2,
            summarize_threshold_tokens: 9_000,
            context_window_messages: 50,
            summarize_keep_last: 4,

            mux_send_timeout_secs: 10,

            metrics_sample_interval_secs: 5,
            metrics_ttl_hours: 48,
        }
    }
}

impl Settings {
    /// Load settings: defaults overridden by `GANTRY_*` environment
    /// variables (e.g. `GANTRY_MAX_QUEUE_SIZE=100`).
    pub fn load() -> GantryResult<Self> {
        let cfg = Config::builder()
            .add_source(Environment::with_prefix("GANTRY"))
            .build()
            .map_err(|e| GantryError::Internal(format!("config build failed: {e}")))?;

        // Start from defaults, then apply whatever the environment set.
        let mut settings = Settings::default();
        let overrides: serde_json::Map<String, serde_json::Value> = cfg
            .try_deserialize()
            .map_err(|e| GantryError::Internal(format!("config parse failed: {e}")))?;
        if !overrides.is_empty() {
            let mut value = serde_json::to_value(&settings)
                .map_err(|e| GantryError::Internal(e.to_string()))?;
            if let serde_json::Value::Object(map) = &mut value {
                for (k, v) in overrides {
                    // Env vars arrive as strings; coerce onto the typed field.
                    if let Some(existing) = map.get(&k) {
                        map.insert(k, coerce_like(existing, v));
                    }
                }
            }
            settings = serde_json::from_value(value)
                .map_err(|e| GantryError::Internal(format!("config merge failed: {e}")))?;
        }
        Ok(settings)
    }

    /// Visibility timeout for a request classified onto `route`.
    pub fn visibility_timeout_for(
        &self,
        route: Option<crate::route::RouteKind>,
    ) -> std::time::Duration {
        let secs = match route {
            Some(r) if r.is_image() => self.image_visibility_timeout_secs,
            _ => self.visibility_timeout_secs,
        };
        std::time::Duration::from_secs(secs)
    }

    /// Generation deadline for a request classified onto `route`.
    pub fn request_deadline_for(
        &self,
        route: Option<crate::route::RouteKind>,
    ) -> std::time::Duration {
        let secs = match route {
            Some(r) if r.is_image() => self.image_request_timeout_secs,
            _ => self.request_timeout_secs,
        };
        std::time::Duration::from_secs(secs)
    }
}

/// Coerce a string env value onto the JSON type of the default field.
fn coerce_like(template: &serde_json::Value, raw: serde_json::Value) -> serde_json::Value {
    let serde_json::Value::String(s) = &raw else {
        return raw;
    };
    match template {
        serde_json::Value::Number(_) => s
            .parse::<i64>()
            .map(serde_json::Value::from)
            .or_else(|_| s.parse::<f64>().map(serde_json::Value::from))
            .unwrap_or(raw),
        serde_json::Value::Bool(_) => s
            .parse::<bool>()
            .map(serde_json::Value::Bool)
            .unwrap_or(raw),
        _ => raw,
    }
}
