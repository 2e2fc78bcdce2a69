//! Engine adapters: one uniform contract across engine kinds.
//!
//! An adapter exposes `generate` / `load` / `unload` / `list_loaded` /
//! `cleanup` regardless of what the engine natively speaks. Engines
//! without dynamic load/unload implement those as recorded intents.
//!
//! Registration is static: [`EngineSet`] is built once at startup from
//! the active profile's endpoints and never changes afterwards.

mod native;
mod openai;
mod static_backend;

pub use native::NativeEngine;
pub use openai::OpenAiCompatEngine;
pub use static_backend::StaticEngine;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use gantry_kernel::error::EngineError;
use gantry_kernel::model::EngineKind;

/// One streamed generation delta.
#[derive(Debug, Clone)]
pub enum GenerationDelta {
    /// A text chunk.
    Text(String),
    /// The model wants a tool invoked.
    ToolCall { name: String, arguments: String },
    /// Terminal usage report; the stream ends after this.
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        generation_secs: f64,
    },
}

/// Receiver end of a generation stream.
///
/// The stream is lazy, finite and non-restartable: deltas arrive in
/// order, a failure surfaces as a single `Err` item, and the channel
/// closes after the terminal usage report or error.
pub type TokenStream = mpsc::Receiver<Result<GenerationDelta, EngineError>>;

/// Chat message in the shape engines accept.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineMessage {
    pub role: String,
    pub content: String,
}

impl EngineMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Generation parameters resolved by the router/preference layer.
#[derive(Debug, Clone, Default)]
pub struct GenerateParams {
    pub temperature: Option<f32>,
    pub thinking: Option<bool>,
    pub max_tokens: Option<u32>,
    /// Engine-specific residency hint forwarded on load.
    pub keep_alive: Option<String>,
    pub allowed_tools: Vec<String>,
    /// Hard deadline for the whole generation.
    pub deadline: Option<Duration>,
}

/// Uniform capability set over one engine endpoint.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Which protocol family this adapter drives.
    fn kind(&self) -> EngineKind;

    /// Stream a generation. Deltas arrive in order; the stream ends
    /// with a [`GenerationDelta::Usage`] item or a single error.
    async fn generate(
        &self,
        model: &str,
        messages: &[EngineMessage],
        params: &GenerateParams,
    ) -> Result<TokenStream, EngineError>;

    /// Preload `model` into the engine's VRAM. A no-op recording intent
    /// for engines without dynamic load.
    async fn load(&self, model: &str, params: &GenerateParams) -> Result<(), EngineError>;

    /// Release `model`'s VRAM. A no-op for engines without dynamic
    /// unload.
    async fn unload(&self, model: &str) -> Result<(), EngineError>;

    /// Truth from the engine: which models it currently has resident.
    async fn list_loaded(&self) -> Result<HashSet<String>, EngineError>;

    /// Post-unload hint (e.g. drop caches). Best-effort.
    async fn cleanup(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// The static engine registration table: kind → adapter.
#[derive(Clone, Default)]
pub struct EngineSet {
    adapters: HashMap<EngineKind, Arc<dyn EngineAdapter>>,
}

impl EngineSet {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(mut self, adapter: Arc<dyn EngineAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn EngineAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = EngineKind> + '_ {
        self.adapters.keys().copied()
    }

    /// Adapters in registration-independent deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = (EngineKind, Arc<dyn EngineAdapter>)> + '_ {
        let mut entries: Vec<_> = self
            .adapters
            .iter()
            .map(|(k, v)| (*k, Arc::clone(v)))
            .collect();
        entries.sort_by_key(|(k, _)| format!("{k}"));
        entries.into_iter()
    }
}

/// Collect a whole stream into text + usage; used by non-streaming
/// callers like the router and summariser.
pub async fn collect_stream(
    mut stream: TokenStream,
) -> Result<(String, Option<(u32, u32, f64)>), EngineError> {
    let mut text = String::new();
    let mut usage = None;
    while let Some(item) = stream.recv().await {
        match item? {
            GenerationDelta::Text(chunk) => text.push_str(&chunk),
            GenerationDelta::ToolCall { .. } => {}
            GenerationDelta::Usage {
                input_tokens,
                output_tokens,
                generation_secs,
            } => usage = Some((input_tokens, output_tokens, generation_secs)),
        }
    }
    Ok((text, usage))
}
