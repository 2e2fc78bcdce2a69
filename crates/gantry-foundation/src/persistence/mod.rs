//! Persistence traits and backends.
//!
//! The control plane talks to conversations and users through these
//! traits only; the remote key-value store behind them is an external
//! collaborator. The in-memory backends here are the default for tests
//! and single-host development.

mod memory;

pub use memory::{MemoryConversationStore, MemoryUserStore};

use async_trait::async_trait;

use gantry_kernel::error::GantryResult;
use gantry_kernel::message::{ConversationMessage, MessageRole};
use gantry_kernel::user::UserState;

/// Conversation message repository.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append a message. The store allocates the monotonic
    /// per-conversation timestamp and caps oversized content.
    async fn add_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        input_tokens: u32,
        output_tokens: u32,
        model_used: Option<&str>,
        generation_secs: Option<f64>,
    ) -> GantryResult<ConversationMessage>;

    /// The most recent `limit` messages, oldest first.
    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> GantryResult<Vec<ConversationMessage>>;

    /// Every message in the conversation, oldest first.
    async fn all_messages(&self, conversation_id: &str) -> GantryResult<Vec<ConversationMessage>>;

    /// Delete the whole conversation; returns how many messages went.
    async fn delete_conversation(&self, conversation_id: &str) -> GantryResult<usize>;

    /// Replace everything except the last `keep_last` messages with a
    /// single summary message.
    async fn replace_with_summary(
        &self,
        conversation_id: &str,
        summary: &str,
        summary_tokens: u32,
        keep_last: usize,
    ) -> GantryResult<()>;
}

/// User state repository.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fetch the user, creating a default record on first sight.
    async fn get_or_create(&self, user_id: &str) -> GantryResult<UserState>;

    /// Add consumed tokens to the user's weekly usage.
    async fn add_usage(&self, user_id: &str, tokens: i64) -> GantryResult<()>;

    /// Overwrite stored preferences.
    async fn set_preferences(
        &self,
        user_id: &str,
        preferred_model: Option<String>,
        temperature: Option<f32>,
        thinking: Option<bool>,
    ) -> GantryResult<()>;

    /// Reset stale accounting weeks across all users; returns how many
    /// users were reset.
    async fn reset_stale_weeks(&self) -> GantryResult<usize>;
}
