//! Model descriptors: what the profile knows about each servable model.
//!
//! Descriptors are loaded from the active profile at startup and treated
//! as read-only afterwards. Residency state lives in the orchestrator's
//! registry, never here.

use serde::{Deserialize, Serialize};

/// Eviction priority of a loaded model.
///
/// The orchestrator only evicts models with *strictly lower* priority
/// than the one being admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl ModelPriority {
    /// Parse the wire form used by the internal API (`LOW` … `CRITICAL`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Some(ModelPriority::Low),
            "NORMAL" => Some(ModelPriority::Normal),
            "HIGH" => Some(ModelPriority::High),
            "CRITICAL" => Some(ModelPriority::Critical),
            _ => None,
        }
    }

    /// The next priority down, if any. `Low` has nothing below it.
    pub fn lower(self) -> Option<Self> {
        match self {
            ModelPriority::Low => None,
            ModelPriority::Normal => Some(ModelPriority::Low),
            ModelPriority::High => Some(ModelPriority::Normal),
            ModelPriority::Critical => Some(ModelPriority::High),
        }
    }
}

impl std::fmt::Display for ModelPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelPriority::Low => "LOW",
            ModelPriority::Normal => "NORMAL",
            ModelPriority::High => "HIGH",
            ModelPriority::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

/// The closed set of engine protocols Gantry can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// `/v1/chat/completions` with SSE streaming.
    OpenAiCompat,
    /// Locally-managed engine with NDJSON streaming, `/api/ps` and
    /// `keep_alive`-based unloading.
    Native,
    /// Monolithic server started with a fixed model set; no dynamic
    /// load or unload.
    Static,
}

impl EngineKind {
    /// Whether the orchestrator can load/unload models on this engine.
    pub fn dynamically_loadable(self) -> bool {
        !matches!(self, EngineKind::Static)
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineKind::OpenAiCompat => "openai_compat",
            EngineKind::Native => "native",
            EngineKind::Static => "static",
        };
        write!(f, "{s}")
    }
}

/// How a model expects its thinking/reasoning mode to be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingFormat {
    /// `think: true/false` toggle.
    #[default]
    Boolean,
    /// `think_level: "low" | "medium" | "high"`.
    Level,
}

/// Capability flags declared by the profile for each model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default)]
    pub tools: bool,
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub thinking: bool,
    #[serde(default = "default_true")]
    pub streaming: bool,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            tools: false,
            vision: false,
            thinking: false,
            streaming: true,
        }
    }
}

impl ModelCapabilities {
    pub fn with_tools(mut self) -> Self {
        self.tools = true;
        self
    }

    pub fn with_vision(mut self) -> Self {
        self.vision = true;
        self
    }

    pub fn with_thinking(mut self) -> Self {
        self.thinking = true;
        self
    }
}

fn default_true() -> bool {
    true
}

/// Everything the control plane knows about one servable model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Catalogue name, e.g. `gpt-oss:20b`.
    pub name: String,
    /// Which engine protocol serves this model.
    pub engine: EngineKind,
    /// Base URL of the serving engine.
    pub endpoint: String,
    /// Declared VRAM footprint used for admission decisions.
    pub vram_gb: f64,
    pub priority: ModelPriority,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    #[serde(default)]
    pub thinking_format: ThinkingFormat,
    /// Engine-specific residency hint, e.g. `"30m"` for native engines.
    #[serde(default)]
    pub keep_alive: Option<String>,
    #[serde(default)]
    pub context_window: Option<u32>,
}

impl ModelDescriptor {
    /// Minimal descriptor for a native-engine model; builder-style
    /// setters fill in the rest.
    pub fn native(name: impl Into<String>, endpoint: impl Into<String>, vram_gb: f64) -> Self {
        Self {
            name: name.into(),
            engine: EngineKind::Native,
            endpoint: endpoint.into(),
            vram_gb,
            priority: ModelPriority::Normal,
            capabilities: ModelCapabilities::default(),
            thinking_format: ThinkingFormat::default(),
            keep_alive: None,
            context_window: None,
        }
    }

    pub fn with_priority(mut self, priority: ModelPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_capabilities(mut self, capabilities: ModelCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_thinking_format(mut self, format: ThinkingFormat) -> Self {
        self.thinking_format = format;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = Some(keep_alive.into());
        self
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = Some(tokens);
        self
    }
}
