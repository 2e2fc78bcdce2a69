//! Scripted engine adapter and control-plane harness.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use gantry_foundation::accountant::TokenAccountant;
use gantry_foundation::context::ContextBuilder;
use gantry_foundation::engine::{
    EngineAdapter, EngineMessage, EngineSet, GenerateParams, GenerationDelta, TokenStream,
};
use gantry_foundation::mux::StreamMux;
use gantry_foundation::persistence::{MemoryConversationStore, MemoryUserStore};
use gantry_foundation::preferences::PreferenceResolver;
use gantry_foundation::queue::AdmissionQueue;
use gantry_foundation::router::Router;
use gantry_foundation::vram::crash::CrashTracker;
use gantry_foundation::vram::orchestrator::VramOrchestrator;
use gantry_foundation::vram::probe::FixedProbe;
use gantry_foundation::worker::WorkerContext;
use gantry_kernel::config::Settings;
use gantry_kernel::error::EngineError;
use gantry_kernel::model::EngineKind;
use gantry_kernel::profile::Profile;

/// Engine that replies with scripted chunks and records every call.
///
/// `responses` is consumed front-first, one entry per `generate` call;
/// when empty, the `fallback` text is streamed instead. Generation can
/// be slowed with `delay` to let tests observe mid-stream states.
pub struct ScriptedEngine {
    kind: EngineKind,
    pub responses: Mutex<Vec<String>>,
    pub fallback: Mutex<String>,
    pub delay: Mutex<Duration>,
    pub loaded: Mutex<HashSet<String>>,
    pub load_calls: Mutex<Vec<String>>,
    pub unload_calls: Mutex<Vec<String>>,
    pub generate_count: Mutex<usize>,
    pub fail_generate: Mutex<Option<EngineError>>,
}

impl ScriptedEngine {
    pub fn new(kind: EngineKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            responses: Mutex::new(Vec::new()),
            fallback: Mutex::new("scripted reply".into()),
            delay: Mutex::new(Duration::ZERO),
            loaded: Mutex::new(HashSet::new()),
            load_calls: Mutex::new(Vec::new()),
            unload_calls: Mutex::new(Vec::new()),
            generate_count: Mutex::new(0),
            fail_generate: Mutex::new(None),
        })
    }

    /// Queue a response for the next `generate` call.
    pub fn push_response(&self, text: &str) {
        self.responses.lock().push(text.to_string());
    }
}

#[async_trait]
impl EngineAdapter for ScriptedEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn generate(
        &self,
        _model: &str,
        _messages: &[EngineMessage],
        _params: &GenerateParams,
    ) -> Result<TokenStream, EngineError> {
        *self.generate_count.lock() += 1;
        if let Some(err) = self.fail_generate.lock().clone() {
            return Err(err);
        }

        let text = {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                self.fallback.lock().clone()
            } else {
                responses.remove(0)
            }
        };
        let delay = *self.delay.lock();

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            // Stream word by word so ordering tests see several tokens.
            let words: Vec<String> = text
                .split_inclusive(' ')
                .map(str::to_string)
                .collect();
            let output_tokens = words.len() as u32;
            for word in words {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(GenerationDelta::Text(word))).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(Ok(GenerationDelta::Usage {
                    input_tokens: 5,
                    output_tokens,
                    generation_secs: 0.05,
                }))
                .await;
        });
        Ok(rx)
    }

    async fn load(&self, model: &str, _params: &GenerateParams) -> Result<(), EngineError> {
        self.load_calls.lock().push(model.to_string());
        self.loaded.lock().insert(model.to_string());
        Ok(())
    }

    async fn unload(&self, model: &str) -> Result<(), EngineError> {
        self.unload_calls.lock().push(model.to_string());
        self.loaded.lock().remove(model);
        Ok(())
    }

    async fn list_loaded(&self) -> Result<HashSet<String>, EngineError> {
        Ok(self.loaded.lock().clone())
    }
}

/// A fully-wired control plane over a [`ScriptedEngine`].
pub struct Harness {
    pub ctx: Arc<WorkerContext>,
    pub engine: Arc<ScriptedEngine>,
    pub conversations: Arc<MemoryConversationStore>,
    pub users: Arc<MemoryUserStore>,
    pub tracker: Arc<CrashTracker>,
}

impl Harness {
    /// Default harness: balanced profile, roomy probe, queue of 10.
    pub fn new() -> Self {
        Self::with_settings(Settings::default(), 10, 3)
    }

    pub fn with_settings(settings: Settings, queue_capacity: usize, max_retries: u32) -> Self {
        let engine = ScriptedEngine::new(EngineKind::Native);
        let engines = EngineSet::new().register(Arc::clone(&engine) as _);
        let profile = Arc::new(Profile::balanced());
        let settings = Arc::new(settings);
        let conversations = MemoryConversationStore::shared();
        let users = MemoryUserStore::shared(
            settings.default_weekly_budget,
            settings.summarize_threshold_tokens,
        );
        let tracker = Arc::new(CrashTracker::new(
            settings.crash_threshold,
            Duration::from_secs(settings.crash_window_secs),
        ));
        let orchestrator = Arc::new(VramOrchestrator::new(
            Arc::clone(&profile),
            engines.clone(),
            Arc::new(FixedProbe::new(128.0, 5.0)),
            Arc::clone(&tracker),
        ));

        let ctx = WorkerContext {
            queue: Arc::new(AdmissionQueue::new(
                queue_capacity,
                queue_capacity,
                max_retries,
            )),
            mux: Arc::new(StreamMux::default()),
            router: Arc::new(Router::new(
                Arc::clone(&profile),
                engines.clone(),
                Arc::clone(&settings),
            )),
            resolver: Arc::new(PreferenceResolver::new(&settings)),
            orchestrator,
            engines: engines.clone(),
            context_builder: Arc::new(ContextBuilder::new(
                Arc::clone(&conversations) as _,
                Arc::clone(&profile),
                engines,
                Arc::clone(&settings),
            )),
            accountant: Arc::new(TokenAccountant::new(Arc::clone(&users) as _, true)),
            conversations: Arc::clone(&conversations) as _,
            users: Arc::clone(&users) as _,
            profile,
            settings,
        };

        Self {
            ctx: Arc::new(ctx),
            engine,
            conversations,
            users,
            tracker,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
