//! Persisted conversation messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest message content the store will keep verbatim.
pub const MAX_MESSAGE_CHARS: usize = 16_000;

/// Marker appended when content is truncated at the storage cap.
pub const TRUNCATION_MARKER: &str = "… [truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    /// A compacted stand-in for older history produced by summarisation.
    Summary,
}

/// One persisted message in a conversation.
///
/// `timestamp` is monotonic per conversation: the store allocates it so
/// an assistant reply always sorts strictly after the user message it
/// answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub conversation_id: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub model_used: Option<String>,
    /// Generation wall-time in seconds, assistant messages only.
    #[serde(default)]
    pub generation_secs: Option<f64>,
}

impl ConversationMessage {
    /// Cap `content` at [`MAX_MESSAGE_CHARS`], appending the truncation
    /// marker when anything was cut.
    pub fn capped_content(content: &str) -> String {
        if content.chars().count() <= MAX_MESSAGE_CHARS {
            return content.to_string();
        }
        let mut capped: String = content.chars().take(MAX_MESSAGE_CHARS).collect();
        capped.push_str(TRUNCATION_MARKER);
        capped
    }

    /// Tokens attributed to this message (input for user, output for
    /// assistant/summary).
    pub fn token_count(&self) -> u32 {
        match self.role {
            MessageRole::User => self.input_tokens,
            MessageRole::Assistant | MessageRole::Summary => self.output_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_content_untouched() {
        assert_eq!(ConversationMessage::capped_content("hello"), "hello");
    }

    #[test]
    fn long_content_truncated_with_marker() {
        let long = "x".repeat(MAX_MESSAGE_CHARS + 100);
        let capped = ConversationMessage::capped_content(&long);
        assert!(capped.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            capped.chars().count(),
            MAX_MESSAGE_CHARS + TRUNCATION_MARKER.chars().count()
        );
    }
}
