//! Context building: load prior messages, summarise when over the
//! user's threshold.
//!
//! Summarisation is inline and blocking within the worker so ordering
//! guarantees stay simple: the compacted history is persisted before
//! the new generation begins.

use std::sync::Arc;

use tracing::{debug, info, warn};

use gantry_kernel::config::Settings;
use gantry_kernel::error::GantryResult;
use gantry_kernel::message::MessageRole;
use gantry_kernel::profile::Profile;
use gantry_kernel::request::estimate_tokens;
use gantry_kernel::user::UserState;

use crate::engine::{EngineMessage, EngineSet, GenerateParams, collect_stream};
use crate::persistence::ConversationStore;

/// Outcome of a context load.
pub struct BuiltContext {
    /// Prior conversation as engine messages, oldest first.
    pub messages: Vec<EngineMessage>,
    pub total_tokens: u32,
    pub summarized: bool,
}

pub struct ContextBuilder {
    store: Arc<dyn ConversationStore>,
    profile: Arc<Profile>,
    engines: EngineSet,
    settings: Arc<Settings>,
}

impl ContextBuilder {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        profile: Arc<Profile>,
        engines: EngineSet,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            profile,
            engines,
            settings,
        }
    }

    /// Load the conversation tail, compacting first when the running
    /// token total exceeds the user's threshold.
    pub async fn load(&self, conversation_id: &str, user: &UserState) -> GantryResult<BuiltContext> {
        let messages = self
            .store
            .recent_messages(conversation_id, self.settings.context_window_messages)
            .await?;
        let total_tokens: u32 = messages.iter().map(|m| m.token_count()).sum();

        let mut summarized = false;
        let messages = if total_tokens > user.summarize_threshold && messages.len() > 2 {
            debug!(
                conversation_id = %conversation_id,
                total_tokens = total_tokens,
                threshold = user.summarize_threshold,
                "context over threshold; summarising"
            );
            match self.summarize(conversation_id, &messages).await {
                Ok(()) => {
                    summarized = true;
                    self.store
                        .recent_messages(conversation_id, self.settings.context_window_messages)
                        .await?
                }
                Err(e) => {
                    // Degraded but not fatal: run with the full tail.
                    warn!(error = %e, "summarisation failed; using uncompacted context");
                    messages
                }
            }
        } else {
            messages
        };

        let engine_messages = messages
            .iter()
            .map(|m| EngineMessage {
                role: match m.role {
                    MessageRole::User => "user".into(),
                    MessageRole::Assistant => "assistant".into(),
                    // Summaries read as prior assistant context.
                    MessageRole::Summary => "assistant".into(),
                },
                content: m.content.clone(),
            })
            .collect::<Vec<_>>();

        let total_tokens = messages.iter().map(|m| m.token_count()).sum();
        Ok(BuiltContext {
            messages: engine_messages,
            total_tokens,
            summarized,
        })
    }

    /// Produce one summary message replacing all but the newest
    /// `summarize_keep_last` messages.
    async fn summarize(
        &self,
        conversation_id: &str,
        messages: &[gantry_kernel::message::ConversationMessage],
    ) -> GantryResult<()> {
        let descriptor = self
            .profile
            .descriptor(&self.profile.summarization_model)
            .ok_or_else(|| {
                gantry_kernel::error::GantryError::UnknownModel(
                    self.profile.summarization_model.clone(),
                )
            })?;
        let engine = self.engines.get(descriptor.engine).ok_or_else(|| {
            gantry_kernel::error::GantryError::EngineUnavailable(descriptor.engine.to_string())
        })?;

        let keep_last = self.settings.summarize_keep_last;
        let head = &messages[..messages.len().saturating_sub(keep_last)];
        if head.is_empty() {
            return Ok(());
        }

        let mut transcript = String::new();
        for message in head {
            let speaker = match message.role {
                MessageRole::User => "User",
                MessageRole::Assistant => "Assistant",
                MessageRole::Summary => "Earlier summary",
            };
            transcript.push_str(&format!("{speaker}: {}\n", message.content));
        }

        let prompt = [
            EngineMessage::system(
                "Summarise the conversation below into a compact paragraph that \
                 preserves facts, decisions and open questions. Reply with the \
                 summary only.",
            ),
            EngineMessage::user(&transcript),
        ];
        let params = GenerateParams {
            temperature: Some(0.2),
            keep_alive: descriptor.keep_alive.clone(),
            ..GenerateParams::default()
        };

        let stream = engine.generate(&descriptor.name, &prompt, &params).await?;
        let (summary, usage) = collect_stream(stream).await?;
        let summary_tokens = usage
            .map(|(_, output, _)| output)
            .unwrap_or_else(|| estimate_tokens(&summary));

        self.store
            .replace_with_summary(conversation_id, &summary, summary_tokens, keep_last)
            .await?;

        info!(
            conversation_id = %conversation_id,
            compacted = head.len(),
            kept = keep_last,
            "conversation summarised"
        );
        Ok(())
    }
}
