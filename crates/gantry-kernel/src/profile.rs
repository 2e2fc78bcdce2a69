//! Runtime profiles: the immutable configuration bundle selected at
//! startup.
//!
//! A profile fixes the model catalogue, declared VRAM per model, the
//! soft/hard limits, the router model and the route→model bindings.
//! Switching profiles is a full restart of the control plane; nothing
//! here is mutable at runtime.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{GantryError, GantryResult};
use crate::model::{EngineKind, ModelCapabilities, ModelDescriptor, ModelPriority, ThinkingFormat};
use crate::route::RouteKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub models: Vec<ModelDescriptor>,
    /// Eviction begins when projected use crosses this line.
    pub soft_limit_gb: f64,
    /// Admission is refused when projected use would cross this line.
    pub hard_limit_gb: f64,
    /// Headroom added to a model's declared footprint when admitting it.
    pub safety_margin_gb: f64,
    /// Models at or above this size trigger an engine cleanup hint
    /// before loading.
    pub large_model_threshold_gb: f64,
    /// Small model used for route classification.
    pub router_model: String,
    pub summarization_model: String,
    /// Concrete model bound to each route.
    pub route_bindings: HashMap<RouteKind, String>,
    /// Per-route temperature suggestions; fall back to the system default.
    pub route_temperatures: HashMap<RouteKind, f32>,
    /// Routes that run with thinking enabled by default.
    pub thinking_routes: Vec<RouteKind>,
}

impl Profile {
    /// Look up a profile by name.
    pub fn by_name(name: &str) -> GantryResult<Self> {
        match name {
            "balanced" => Ok(Self::balanced()),
            "performance" => Ok(Self::performance()),
            other => Err(GantryError::Internal(format!("unknown profile: {other}"))),
        }
    }

    /// Descriptor for `name`, if the catalogue has it.
    pub fn descriptor(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Model bound to `route`; profiles are validated so this only
    /// returns `None` for routes a profile deliberately leaves unbound.
    pub fn model_for_route(&self, route: RouteKind) -> Option<&str> {
        self.route_bindings.get(&route).map(String::as_str)
    }

    pub fn temperature_for_route(&self, route: RouteKind, default: f32) -> f32 {
        self.route_temperatures.get(&route).copied().unwrap_or(default)
    }

    pub fn thinking_for_route(&self, route: RouteKind) -> bool {
        self.thinking_routes.contains(&route)
    }

    /// Every bound route model must exist in the catalogue.
    pub fn validate(&self) -> GantryResult<()> {
        let catalogue: std::collections::HashSet<&str> =
            self.models.iter().map(|m| m.name.as_str()).collect();

        let mut referenced: Vec<&str> = vec![&self.router_model, &self.summarization_model];
        referenced.extend(self.route_bindings.values().map(String::as_str));

        let missing: Vec<&str> = referenced
            .into_iter()
            .filter(|name| !catalogue.contains(name))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(GantryError::Internal(format!(
                "profile {}: bound models not in catalogue: {}",
                self.name,
                missing.join(", ")
            )))
        }
    }

    /// Profile for large-memory single-GPU hosts: a wide catalogue on a
    /// native engine, big models admitted under generous limits.
    pub fn balanced() -> Self {
        let native = "http://127.0.0.1:11434";
        let models = vec![
            ModelDescriptor::native("gpt-oss:20b", native, 13.0)
                .with_priority(ModelPriority::High)
                .with_capabilities(ModelCapabilities::default().with_tools().with_thinking())
                .with_thinking_format(ThinkingFormat::Level)
                .with_keep_alive("30m"),
            ModelDescriptor::native("gpt-oss:120b", native, 76.0)
                .with_priority(ModelPriority::High)
                .with_capabilities(ModelCapabilities::default().with_tools().with_thinking())
                .with_thinking_format(ThinkingFormat::Level)
                .with_keep_alive("15m"),
            ModelDescriptor::native("rnj-1:8b", native, 5.1)
                .with_priority(ModelPriority::High)
                .with_capabilities(ModelCapabilities::default().with_tools())
                .with_keep_alive("30m"),
            ModelDescriptor::native("ministral-3:14b", native, 9.1)
                .with_capabilities(ModelCapabilities::default().with_tools().with_vision())
                .with_keep_alive("20m"),
            ModelDescriptor::native("devstral-small-2:24b", native, 15.0)
                .with_capabilities(ModelCapabilities::default().with_tools())
                .with_keep_alive("20m"),
            ModelDescriptor::native("deepseek-r1:70b", native, 42.0)
                .with_priority(ModelPriority::Low)
                .with_capabilities(ModelCapabilities::default().with_thinking())
                .with_keep_alive("10m"),
            ModelDescriptor::native("qwen3-embedding:4b", native, 2.5)
                .with_priority(ModelPriority::Low)
                .with_keep_alive("60m"),
            ModelDescriptor::native("qwen3:4b", native, 2.5)
                .with_priority(ModelPriority::Low)
                .with_capabilities(ModelCapabilities::default().with_tools().with_thinking())
                .with_context_window(262_144)
                .with_keep_alive("5s"),
        ];

        let route_bindings = HashMap::from([
            (RouteKind::SelfHandle, "qwen3:4b".to_string()),
            (RouteKind::SimpleCode, "rnj-1:8b".to_string()),
            (RouteKind::Reasoning, "gpt-oss:120b".to_string()),
            (RouteKind::Research, "gpt-oss:120b".to_string()),
            (RouteKind::Math, "gpt-oss:120b".to_string()),
            (RouteKind::Vision, "ministral-3:14b".to_string()),
            (RouteKind::Image, "ministral-3:14b".to_string()),
            (RouteKind::Embedding, "qwen3-embedding:4b".to_string()),
        ]);

        let route_temperatures = HashMap::from([
            (RouteKind::SimpleCode, 0.1),
            (RouteKind::Math, 0.1),
            (RouteKind::Research, 0.4),
        ]);

        Self {
            name: "balanced".into(),
            models,
            soft_limit_gb: 100.0,
            hard_limit_gb: 110.0,
            safety_margin_gb: 2.0,
            large_model_threshold_gb: 40.0,
            router_model: "gpt-oss:20b".into(),
            summarization_model: "gpt-oss:20b".into(),
            route_bindings,
            route_temperatures,
            thinking_routes: vec![RouteKind::Reasoning, RouteKind::Research, RouteKind::Math],
        }
    }

    /// Profile for latency-sensitive hosts: a static high-throughput
    /// server carries the heavy routes, a small native catalogue covers
    /// the rest.
    pub fn performance() -> Self {
        let native = "http://127.0.0.1:11434";
        let static_srv = "http://127.0.0.1:30000";
        let models = vec![
            ModelDescriptor::native("gpt-oss:20b", native, 13.0)
                .with_priority(ModelPriority::High)
                .with_capabilities(ModelCapabilities::default().with_tools().with_thinking())
                .with_thinking_format(ThinkingFormat::Level)
                .with_keep_alive("30m"),
            ModelDescriptor::native("rnj-1:8b", native, 5.1)
                .with_priority(ModelPriority::High)
                .with_capabilities(ModelCapabilities::default().with_tools())
                .with_keep_alive("30m"),
            ModelDescriptor::native("ministral-3:14b", native, 9.1)
                .with_capabilities(ModelCapabilities::default().with_tools().with_vision())
                .with_keep_alive("20m"),
            ModelDescriptor::native("qwen3-embedding:4b", native, 2.5)
                .with_priority(ModelPriority::Low)
                .with_keep_alive("60m"),
            ModelDescriptor::native("qwen3:4b", native, 2.5)
                .with_priority(ModelPriority::Low)
                .with_capabilities(ModelCapabilities::default().with_tools().with_thinking())
                .with_keep_alive("5s"),
            // Served by the monolithic engine; resident for its lifetime.
            ModelDescriptor {
                name: "glm-4-6:air".into(),
                engine: EngineKind::Static,
                endpoint: static_srv.into(),
                vram_gb: 68.0,
                priority: ModelPriority::Critical,
                capabilities: ModelCapabilities::default().with_tools().with_thinking(),
                thinking_format: ThinkingFormat::Boolean,
                keep_alive: None,
                context_window: Some(131_072),
            },
        ];

        let route_bindings = HashMap::from([
            (RouteKind::SelfHandle, "qwen3:4b".to_string()),
            (RouteKind::SimpleCode, "rnj-1:8b".to_string()),
            (RouteKind::Reasoning, "glm-4-6:air".to_string()),
            (RouteKind::Research, "glm-4-6:air".to_string()),
            (RouteKind::Math, "glm-4-6:air".to_string()),
            (RouteKind::Vision, "ministral-3:14b".to_string()),
            (RouteKind::Image, "ministral-3:14b".to_string()),
            (RouteKind::Embedding, "qwen3-embedding:4b".to_string()),
        ]);

        Self {
            name: "performance".into(),
            models,
            soft_limit_gb: 100.0,
            hard_limit_gb: 110.0,
            safety_margin_gb: 2.0,
            large_model_threshold_gb: 40.0,
            router_model: "gpt-oss:20b".into(),
            summarization_model: "gpt-oss:20b".into(),
            route_bindings,
            route_temperatures: HashMap::from([(RouteKind::SimpleCode, 0.1)]),
            thinking_routes: vec![RouteKind::Reasoning, RouteKind::Research, RouteKind::Math],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_validate() {
        Profile::balanced().validate().unwrap();
        Profile::performance().validate().unwrap();
    }

    #[test]
    fn by_name_resolves_known_profiles() {
        assert_eq!(Profile::by_name("balanced").unwrap().name, "balanced");
        assert_eq!(Profile::by_name("performance").unwrap().name, "performance");
        assert!(Profile::by_name("turbo").is_err());
    }

    #[test]
    fn every_route_is_bound_in_balanced() {
        let p = Profile::balanced();
        for route in RouteKind::ALL {
            assert!(
                p.model_for_route(route).is_some(),
                "route {route} unbound in balanced profile"
            );
        }
    }

    #[test]
    fn validation_catches_missing_models() {
        let mut p = Profile::balanced();
        p.route_bindings
            .insert(RouteKind::Math, "nonexistent:1b".into());
        assert!(p.validate().is_err());
    }

    #[test]
    fn route_temperature_falls_back_to_default() {
        let p = Profile::balanced();
        assert_eq!(p.temperature_for_route(RouteKind::SimpleCode, 0.2), 0.1);
        assert_eq!(p.temperature_for_route(RouteKind::SelfHandle, 0.2), 0.2);
    }

    #[test]
    fn performance_profile_has_a_static_engine_model() {
        let p = Profile::performance();
        let glm = p.descriptor("glm-4-6:air").unwrap();
        assert_eq!(glm.engine, EngineKind::Static);
        assert!(!glm.engine.dynamically_loadable());
    }
}
