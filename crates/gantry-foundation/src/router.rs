//! Request classification into routes.
//!
//! A light LLM call into the profile's router model produces a single
//! label which is parsed against the closed [`RouteKind`] set. The
//! router must never block the pipeline: any engine failure falls back
//! to the `REASONING` route. Classification is idempotent: the same
//! text yields the same prompt and the parse is deterministic.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use gantry_kernel::config::Settings;
use gantry_kernel::profile::Profile;
use gantry_kernel::request::ChatRequest;
use gantry_kernel::route::{RouteDecision, RouteKind};

use crate::engine::{EngineMessage, EngineSet, GenerateParams, collect_stream};

/// Classifier responses are one label; anything slow is a waste.
const CLASSIFY_DEADLINE: Duration = Duration::from_secs(30);

const CLASSIFIER_SYSTEM_PROMPT: &str = "You are a request classifier. \
Reply with exactly one label from this list and nothing else:\n\
SELF_HANDLE - greetings, small talk, questions answerable in one line\n\
SIMPLE_CODE - writing, fixing or explaining code\n\
REASONING - analysis, comparison, multi-step thinking\n\
RESEARCH - questions needing current or external information\n\
MATH - mathematical problems and calculations\n\
IMAGE - requests to generate an image\n\
VISION - questions about an attached image\n\
EMBEDDING - requests for embeddings or similarity";

pub struct Router {
    profile: Arc<Profile>,
    engines: EngineSet,
    settings: Arc<Settings>,
}

impl Router {
    pub fn new(profile: Arc<Profile>, engines: EngineSet, settings: Arc<Settings>) -> Self {
        Self {
            profile,
            engines,
            settings,
        }
    }

    /// Classify `request` and bind the profile's model and parameters.
    pub async fn classify(&self, request: &ChatRequest) -> RouteDecision {
        let route = self.pick_route(request).await;
        self.decide(route)
    }

    /// Bind profile parameters onto an already-known route.
    pub fn decide(&self, route: RouteKind) -> RouteDecision {
        let model = self
            .profile
            .model_for_route(route)
            .unwrap_or(&self.profile.router_model)
            .to_string();
        RouteDecision {
            route,
            model,
            temperature: self
                .profile
                .temperature_for_route(route, self.settings.default_temperature),
            thinking: self.profile.thinking_for_route(route),
            allowed_tools: match route {
                RouteKind::Research => vec!["web_search".into(), "web_fetch".into()],
                RouteKind::Reasoning => vec!["web_search".into()],
                _ => Vec::new(),
            },
        }
    }

    async fn pick_route(&self, request: &ChatRequest) -> RouteKind {
        // Preprocessing hints win outright; attached images force the
        // vision route regardless of what the text says.
        if let Some(hint) = request.classification {
            return hint;
        }
        if request.has_image_attachment() {
            return RouteKind::Vision;
        }

        let Some(descriptor) = self.profile.descriptor(&self.profile.router_model) else {
            warn!("router model missing from profile; falling back to REASONING");
            return RouteKind::Reasoning;
        };
        let Some(engine) = self.engines.get(descriptor.engine) else {
            warn!("no engine for router model; falling back to REASONING");
            return RouteKind::Reasoning;
        };

        let messages = [
            EngineMessage::system(CLASSIFIER_SYSTEM_PROMPT),
            EngineMessage::user(&request.content),
        ];
        let params = GenerateParams {
            temperature: Some(0.0),
            max_tokens: Some(8),
            keep_alive: descriptor.keep_alive.clone(),
            deadline: Some(CLASSIFY_DEADLINE),
            ..GenerateParams::default()
        };

        let label = match engine
            .generate(&descriptor.name, &messages, &params)
            .await
        {
            Ok(stream) => match collect_stream(stream).await {
                Ok((text, _)) => text,
                Err(e) => {
                    warn!(error = %e, "router stream failed; falling back to REASONING");
                    return RouteKind::Reasoning;
                }
            },
            Err(e) => {
                warn!(error = %e, "router call failed; falling back to REASONING");
                return RouteKind::Reasoning;
            }
        };

        let route = RouteKind::parse_label(&label);
        debug!(label = %label.trim(), route = %route, "request classified");
        route
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockEngine;
    use gantry_kernel::error::EngineError;
    use gantry_kernel::model::EngineKind;

    fn router_with_response(response: &str) -> Router {
        let engine = Arc::new(MockEngine::new(EngineKind::Native).with_response(response));
        Router::new(
            Arc::new(Profile::balanced()),
            EngineSet::new().register(engine),
            Arc::new(Settings::default()),
        )
    }

    #[tokio::test]
    async fn classifies_from_router_label() {
        let router = router_with_response("SIMPLE_CODE");
        let request = ChatRequest::new("h", "c", "u", "write a fizzbuzz");
        let decision = router.classify(&request).await;
        assert_eq!(decision.route, RouteKind::SimpleCode);
        assert_eq!(decision.model, "rnj-1:8b");
        assert!((decision.temperature - 0.1).abs() < 1e-6);
    }

    #[tokio::test]
    async fn prose_response_still_parses() {
        let router = router_with_response("I think RESEARCH fits best.");
        let request = ChatRequest::new("h", "c", "u", "latest rustc release?");
        let decision = router.classify(&request).await;
        assert_eq!(decision.route, RouteKind::Research);
        assert!(decision.allowed_tools.contains(&"web_search".to_string()));
    }

    #[tokio::test]
    async fn unparseable_response_falls_back() {
        let router = router_with_response("42");
        let request = ChatRequest::new("h", "c", "u", "hmm");
        let decision = router.classify(&request).await;
        assert_eq!(decision.route, RouteKind::Reasoning);
    }

    #[tokio::test]
    async fn engine_failure_falls_back_to_reasoning() {
        let engine = Arc::new(MockEngine::new(EngineKind::Native));
        *engine.fail_generate.lock() = Some(EngineError::Unreachable("down".into()));
        let router = Router::new(
            Arc::new(Profile::balanced()),
            EngineSet::new().register(engine),
            Arc::new(Settings::default()),
        );
        let request = ChatRequest::new("h", "c", "u", "anything");
        let decision = router.classify(&request).await;
        assert_eq!(decision.route, RouteKind::Reasoning);
        assert_eq!(decision.model, "gpt-oss:120b");
    }

    #[tokio::test]
    async fn classification_hint_short_circuits() {
        let router = router_with_response("SIMPLE_CODE");
        let request =
            ChatRequest::new("h", "c", "u", "whatever").with_classification(RouteKind::Math);
        let decision = router.classify(&request).await;
        assert_eq!(decision.route, RouteKind::Math);
    }

    #[tokio::test]
    async fn image_attachment_forces_vision() {
        let router = router_with_response("SELF_HANDLE");
        let mut request = ChatRequest::new("h", "c", "u", "what is in this picture");
        request.file_refs.push(gantry_kernel::request::FileRef {
            filename: "photo.png".into(),
            extracted_content: String::new(),
            is_image: true,
        });
        let decision = router.classify(&request).await;
        assert_eq!(decision.route, RouteKind::Vision);
        assert_eq!(decision.model, "ministral-3:14b");
    }

    #[tokio::test]
    async fn thinking_enabled_on_reasoning_routes() {
        let router = router_with_response("REASONING");
        let request = ChatRequest::new("h", "c", "u", "compare A and B");
        let decision = router.classify(&request).await;
        assert!(decision.thinking);
    }
}
