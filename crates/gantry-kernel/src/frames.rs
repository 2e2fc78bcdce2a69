//! Wire frames spoken over the chat WebSocket.
//!
//! Outgoing frames are emitted by the worker through the stream
//! multiplexer and by the ingress handler directly; per-handle ordering
//! is guaranteed by the multiplexer, never by the serialisation layer.

use serde::{Deserialize, Serialize};

use crate::message::ConversationMessage;
use crate::request::FileRef;

/// Frames sent by the server to a chat client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// The request was admitted to the queue.
    Queued {
        request_id: String,
        queue_position: usize,
    },
    /// A worker picked the request up.
    Processing { request_id: String },
    /// One generation delta.
    Token { content: String },
    /// The model started a tool call.
    ToolStart { name: String },
    /// The tool call finished.
    ToolEnd { name: String },
    /// Terminal success.
    Done {
        message_id: String,
        tokens_used: u32,
        generation_time: f64,
        model: String,
        #[serde(default)]
        artifacts: Vec<String>,
    },
    /// Terminal failure.
    Error { error: String },
    /// Reply to a `history` request.
    History {
        conversation_id: String,
        messages: Vec<HistoryMessage>,
    },
    /// Reply to a `close` request.
    CloseComplete {
        conversation_id: String,
        deleted_count: usize,
    },
    /// Informational notice (e.g. history was summarised).
    Notice { message: String },
    /// Keep-alive reply.
    Pong,
}

/// Frames accepted from a chat client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message {
        #[serde(default)]
        content: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        thinking: Option<bool>,
        #[serde(default)]
        file_refs: Vec<FileRef>,
    },
    Ping,
    History,
    Close,
}

/// Client-facing projection of a persisted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub timestamp: String,
    pub tokens_used: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_time: Option<f64>,
}

impl From<&ConversationMessage> for HistoryMessage {
    fn from(msg: &ConversationMessage) -> Self {
        Self {
            id: msg.message_id.clone(),
            role: match msg.role {
                crate::message::MessageRole::User => "user".into(),
                crate::message::MessageRole::Assistant => "assistant".into(),
                crate::message::MessageRole::Summary => "summary".into(),
            },
            content: msg.content.clone(),
            timestamp: msg.timestamp.to_rfc3339(),
            tokens_used: msg.token_count(),
            model: msg.model_used.clone(),
            generation_time: msg.generation_secs,
        }
    }
}
