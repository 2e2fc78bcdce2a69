//! In-memory storage backends.
//!
//! Thread-safe map-backed implementations of the persistence traits,
//! suitable for tests and single-host development. Timestamps are
//! allocated monotonically per conversation so an assistant reply
//! always sorts strictly after the user message it answers, even when
//! two writes land in the same clock tick.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use gantry_kernel::error::GantryResult;
use gantry_kernel::message::{ConversationMessage, MessageRole};
use gantry_kernel::user::UserState;

use super::{ConversationStore, UserStore};

#[derive(Default)]
struct ConversationData {
    messages: Vec<ConversationMessage>,
    last_timestamp: Option<DateTime<Utc>>,
}

/// In-memory conversation store.
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: RwLock<HashMap<String, ConversationData>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn message_count(&self, conversation_id: &str) -> usize {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .map(|c| c.messages.len())
            .unwrap_or(0)
    }

    pub async fn clear(&self) {
        self.conversations.write().await.clear();
    }

    /// Strictly-increasing timestamp for this conversation.
    fn next_timestamp(data: &mut ConversationData) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match data.last_timestamp {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        data.last_timestamp = Some(ts);
        ts
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn add_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        input_tokens: u32,
        output_tokens: u32,
        model_used: Option<&str>,
        generation_secs: Option<f64>,
    ) -> GantryResult<ConversationMessage> {
        let mut conversations = self.conversations.write().await;
        let data = conversations
            .entry(conversation_id.to_string())
            .or_default();

        let message = ConversationMessage {
            conversation_id: conversation_id.to_string(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: Self::next_timestamp(data),
            role,
            content: ConversationMessage::capped_content(content),
            input_tokens,
            output_tokens,
            model_used: model_used.map(str::to_string),
            generation_secs,
        };
        data.messages.push(message.clone());
        Ok(message)
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> GantryResult<Vec<ConversationMessage>> {
        let conversations = self.conversations.read().await;
        let Some(data) = conversations.get(conversation_id) else {
            return Ok(Vec::new());
        };
        let skip = data.messages.len().saturating_sub(limit);
        Ok(data.messages[skip..].to_vec())
    }

    async fn all_messages(&self, conversation_id: &str) -> GantryResult<Vec<ConversationMessage>> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> GantryResult<usize> {
        let mut conversations = self.conversations.write().await;
        Ok(conversations
            .remove(conversation_id)
            .map(|c| c.messages.len())
            .unwrap_or(0))
    }

    async fn replace_with_summary(
        &self,
        conversation_id: &str,
        summary: &str,
        summary_tokens: u32,
        keep_last: usize,
    ) -> GantryResult<()> {
        let mut conversations = self.conversations.write().await;
        let Some(data) = conversations.get_mut(conversation_id) else {
            return Ok(());
        };

        let tail_start = data.messages.len().saturating_sub(keep_last);
        let tail: Vec<ConversationMessage> = data.messages.split_off(tail_start);
        data.messages.clear();

        let summary_message = ConversationMessage {
            conversation_id: conversation_id.to_string(),
            message_id: Uuid::new_v4().to_string(),
            // Sorts before the preserved tail.
            timestamp: tail
                .first()
                .map(|m| m.timestamp - ChronoDuration::microseconds(1))
                .unwrap_or_else(Utc::now),
            role: MessageRole::Summary,
            content: ConversationMessage::capped_content(summary),
            input_tokens: 0,
            output_tokens: summary_tokens,
            model_used: None,
            generation_secs: None,
        };
        data.messages.push(summary_message);
        data.messages.extend(tail);
        Ok(())
    }
}

/// In-memory user store.
pub struct MemoryUserStore {
    users: RwLock<HashMap<String, UserState>>,
    default_weekly_budget: i64,
    default_summarize_threshold: u32,
}

impl MemoryUserStore {
    pub fn new(default_weekly_budget: i64, default_summarize_threshold: u32) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            default_weekly_budget,
            default_summarize_threshold,
        }
    }

    pub fn shared(default_weekly_budget: i64, default_summarize_threshold: u32) -> Arc<Self> {
        Arc::new(Self::new(default_weekly_budget, default_summarize_threshold))
    }

    /// Test helper: install a user wholesale.
    pub async fn insert(&self, user: UserState) {
        self.users.write().await.insert(user.user_id.clone(), user);
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_or_create(&self, user_id: &str) -> GantryResult<UserState> {
        let mut users = self.users.write().await;
        let user = users.entry(user_id.to_string()).or_insert_with(|| {
            UserState::new(
                user_id,
                self.default_weekly_budget,
                self.default_summarize_threshold,
            )
        });
        Ok(user.clone())
    }

    async fn add_usage(&self, user_id: &str, tokens: i64) -> GantryResult<()> {
        let mut users = self.users.write().await;
        if let Some(user) = users.get_mut(user_id) {
            user.used_this_week += tokens;
        }
        Ok(())
    }

    async fn set_preferences(
        &self,
        user_id: &str,
        preferred_model: Option<String>,
        temperature: Option<f32>,
        thinking: Option<bool>,
    ) -> GantryResult<()> {
        let mut users = self.users.write().await;
        if let Some(user) = users.get_mut(user_id) {
            user.preferred_model = preferred_model;
            user.temperature = temperature;
            user.thinking = thinking;
        }
        Ok(())
    }

    async fn reset_stale_weeks(&self) -> GantryResult<usize> {
        let mut users = self.users.write().await;
        let mut reset = 0;
        for user in users.values_mut() {
            if user.week_is_stale() {
                user.start_new_week();
                reset += 1;
            }
        }
        Ok(reset)
    }
}
