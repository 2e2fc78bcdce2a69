//! Adapter for monolithic servers that start with a fixed model set.
//!
//! These engines cannot load or unload dynamically; both operations
//! record intent and return. Generation reuses the OpenAI-compatible
//! chat surface, which such servers conventionally expose, and
//! `list_loaded` queries `/v1/models` as the residency truth.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use gantry_kernel::error::EngineError;
use gantry_kernel::model::EngineKind;

use super::openai::OpenAiCompatEngine;
use super::{EngineAdapter, EngineMessage, GenerateParams, TokenStream};

pub struct StaticEngine {
    inner: OpenAiCompatEngine,
    intended: Mutex<HashSet<String>>,
}

impl StaticEngine {
    pub fn new(base_url: impl Into<String>) -> Result<Self, EngineError> {
        Ok(Self {
            inner: OpenAiCompatEngine::new(base_url, None)?,
            intended: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl EngineAdapter for StaticEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Static
    }

    async fn generate(
        &self,
        model: &str,
        messages: &[EngineMessage],
        params: &GenerateParams,
    ) -> Result<TokenStream, EngineError> {
        self.inner.generate(model, messages, params).await
    }

    async fn load(&self, model: &str, _params: &GenerateParams) -> Result<(), EngineError> {
        self.intended.lock().insert(model.to_string());
        Ok(())
    }

    async fn unload(&self, model: &str) -> Result<(), EngineError> {
        warn!(
            model = %model,
            "static engine cannot unload; model stays resident until server restart"
        );
        self.intended.lock().remove(model);
        Ok(())
    }

    async fn list_loaded(&self) -> Result<HashSet<String>, EngineError> {
        self.inner.list_loaded().await
    }
}
