//! The chat request as it moves through the admission queue and workers.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::route::RouteKind;

/// Origin tier of a request, set by the front-end adapter.
///
/// Tiers do not change queue ordering (pure FIFO); they only affect the
/// watermark admission policy and operator tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OriginTier {
    #[default]
    Normal,
    Priority,
    Admin,
}

/// A pre-extracted file artefact attached to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub filename: String,
    /// Text already extracted by the upload pipeline.
    #[serde(default)]
    pub extracted_content: String,
    /// Whether the artefact is an image (drives vision routing).
    #[serde(default)]
    pub is_image: bool,
}

/// One inference request.
///
/// Created by a front-end adapter, state-mutated only by the queue
/// (`started_at`, in-flight transitions) and the worker (`retry_count`
/// via requeue), and dropped once a terminal frame has been sent.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub id: String,
    pub tier: OriginTier,
    /// Opaque handle used by the multiplexer to find the client connection.
    pub client_handle: String,
    pub conversation_id: String,
    pub user_id: String,
    pub content: String,
    pub file_refs: Vec<FileRef>,
    /// Explicit model override from the client, if any.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub thinking: Option<bool>,
    /// Rough input-token estimate made at ingress.
    pub estimated_tokens: u32,
    /// Classification hint set by preprocessing (e.g. attached images).
    pub classification: Option<RouteKind>,
    pub enqueued_at: Instant,
    /// Stamped by the queue when the request is dequeued.
    pub started_at: Option<Instant>,
    pub retry_count: u32,
}

impl ChatRequest {
    pub fn new(
        client_handle: impl Into<String>,
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tier: OriginTier::Normal,
            client_handle: client_handle.into(),
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            content: content.into(),
            file_refs: Vec::new(),
            model: None,
            temperature: None,
            thinking: None,
            estimated_tokens: 0,
            classification: None,
            enqueued_at: Instant::now(),
            started_at: None,
            retry_count: 0,
        }
    }

    pub fn with_tier(mut self, tier: OriginTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_estimated_tokens(mut self, tokens: u32) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    pub fn with_classification(mut self, route: RouteKind) -> Self {
        self.classification = Some(route);
        self
    }

    /// Whether any attached artefact is an image.
    pub fn has_image_attachment(&self) -> bool {
        self.file_refs.iter().any(|f| f.is_image)
    }

    /// Message text plus extracted file content, the form used for token
    /// estimation and prompting.
    pub fn content_with_files(&self) -> String {
        if self.file_refs.is_empty() {
            return self.content.clone();
        }
        let mut out = self.content.clone();
        for file in &self.file_refs {
            if !file.extracted_content.is_empty() {
                out.push_str(&format!(
                    "\n[File: {}]\n{}",
                    file.filename, file.extracted_content
                ));
            }
        }
        out
    }
}

/// Rough token estimate used at ingress: one token per four characters.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let a = ChatRequest::new("h", "c", "u", "hi");
        let b = ChatRequest::new("h", "c", "u", "hi");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn content_with_files_appends_extractions() {
        let mut req = ChatRequest::new("h", "c", "u", "review this");
        req.file_refs.push(FileRef {
            filename: "main.rs".into(),
            extracted_content: "fn main() {}".into(),
            is_image: false,
        });
        let text = req.content_with_files();
        assert!(text.starts_with("review this"));
        assert!(text.contains("[File: main.rs]"));
        assert!(text.contains("fn main() {}"));
    }

    #[test]
    fn image_attachment_detection() {
        let mut req = ChatRequest::new("h", "c", "u", "what is this");
        assert!(!req.has_image_attachment());
        req.file_refs.push(FileRef {
            filename: "photo.png".into(),
            extracted_content: String::new(),
            is_image: true,
        });
        assert!(req.has_image_attachment());
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
