//! Routes: the categorical decision about how a request is serviced.

use serde::{Deserialize, Serialize};

/// The closed set of routes the classifier can choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteKind {
    /// Trivial exchanges the gateway can answer without a large model.
    SelfHandle,
    SimpleCode,
    Reasoning,
    Research,
    Math,
    /// Image generation.
    Image,
    /// Image understanding.
    Vision,
    Embedding,
}

impl RouteKind {
    /// All route labels, used by the classifier prompt and the parser.
    pub const ALL: [RouteKind; 8] = [
        RouteKind::SelfHandle,
        RouteKind::SimpleCode,
        RouteKind::Reasoning,
        RouteKind::Research,
        RouteKind::Math,
        RouteKind::Image,
        RouteKind::Vision,
        RouteKind::Embedding,
    ];

    /// Wire label, e.g. `SIMPLE_CODE`.
    pub fn label(self) -> &'static str {
        match self {
            RouteKind::SelfHandle => "SELF_HANDLE",
            RouteKind::SimpleCode => "SIMPLE_CODE",
            RouteKind::Reasoning => "REASONING",
            RouteKind::Research => "RESEARCH",
            RouteKind::Math => "MATH",
            RouteKind::Image => "IMAGE",
            RouteKind::Vision => "VISION",
            RouteKind::Embedding => "EMBEDDING",
        }
    }

    /// Deterministic parse of a router-model response.
    ///
    /// The first route whose exact label appears anywhere in the text
    /// wins; unrecognised output falls back to [`RouteKind::Reasoning`].
    /// Longer labels are checked first so `SELF_HANDLE` is not shadowed
    /// by a hypothetical shorter match.
    pub fn parse_label(text: &str) -> RouteKind {
        let upper = text.to_ascii_uppercase();
        let mut by_len: Vec<RouteKind> = Self::ALL.to_vec();
        by_len.sort_by_key(|r| std::cmp::Reverse(r.label().len()));
        by_len
            .into_iter()
            .find(|r| upper.contains(r.label()))
            .unwrap_or(RouteKind::Reasoning)
    }

    /// Routes that drive image pipelines get the long visibility timeout.
    pub fn is_image(self) -> bool {
        matches!(self, RouteKind::Image | RouteKind::Vision)
    }
}

impl std::fmt::Display for RouteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// The router's output: a route plus the concrete serving parameters
/// bound from the active profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub route: RouteKind,
    /// Concrete model name bound to the route by the profile.
    pub model: String,
    pub temperature: f32,
    pub thinking: bool,
    /// Tools the worker may expose to the model on this route.
    pub allowed_tools: Vec<String>,
}
