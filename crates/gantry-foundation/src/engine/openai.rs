//! OpenAI-compatible engine adapter.
//!
//! Speaks `/v1/chat/completions` with `stream=true` and SSE framing.
//! `GET /v1/models` is the list-loaded truth. Load and unload record
//! intent only: OpenAI-compatible servers manage their own residency.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use gantry_kernel::error::EngineError;
use gantry_kernel::model::EngineKind;

use super::{EngineAdapter, EngineMessage, GenerateParams, GenerationDelta, TokenStream};

/// Default wall-clock deadline when the caller sets none.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(300);

pub struct OpenAiCompatEngine {
    base_url: String,
    api_key: Option<String>,
    client: Client,
    /// Models the orchestrator asked us to consider resident. The server
    /// itself decides what is actually loaded; this records intent so
    /// `list_loaded` stays meaningful when `/v1/models` is unavailable.
    intended: Mutex<HashSet<String>>,
}

impl OpenAiCompatEngine {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::Protocol(format!("client build failed: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
            intended: Mutex::new(HashSet::new()),
        })
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("authorization", format!("Bearer {key}")),
            None => builder,
        }
    }

    fn map_send_error(err: reqwest::Error, deadline: Duration) -> EngineError {
        if err.is_timeout() {
            EngineError::Timeout(deadline.as_secs())
        } else if err.is_connect() {
            EngineError::Unreachable(err.to_string())
        } else {
            EngineError::Protocol(err.to_string())
        }
    }
}

/// One parsed SSE chunk from `/v1/chat/completions`.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[async_trait]
impl EngineAdapter for OpenAiCompatEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::OpenAiCompat
    }

    async fn generate(
        &self,
        model: &str,
        messages: &[EngineMessage],
        params: &GenerateParams,
    ) -> Result<TokenStream, EngineError> {
        let deadline = params.deadline.unwrap_or(DEFAULT_DEADLINE);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(t) = params.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = params.max_tokens {
            body["max_tokens"] = json!(max);
        }

        debug!(model = %model, url = %url, "starting SSE generation");
        let started = Instant::now();

        let response = self
            .auth(self.client.post(&url))
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::map_send_error(e, deadline))?;

        let status = response.status().as_u16();
        if status >= 400 {
            let message = response.text().await.unwrap_or_default();
            return Err(EngineError::Status { status, message });
        }

        let (tx, rx) = mpsc::channel(64);
        let mut byte_stream = response.bytes_stream();
        let deadline_secs = deadline.as_secs();

        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut prompt_tokens = 0u32;
            let mut completion_tokens = 0u32;
            let mut usage_seen = false;

            while let Some(item) = byte_stream.next().await {
                let bytes = match item {
                    Ok(b) => b,
                    Err(e) => {
                        let err = if e.is_timeout() {
                            EngineError::Timeout(deadline_secs)
                        } else {
                            EngineError::Unreachable(e.to_string())
                        };
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // SSE events are newline-delimited `data: ` lines.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        if !usage_seen {
                            let _ = tx
                                .send(Ok(GenerationDelta::Usage {
                                    input_tokens: prompt_tokens,
                                    output_tokens: completion_tokens,
                                    generation_secs: started.elapsed().as_secs_f64(),
                                }))
                                .await;
                        }
                        return;
                    }

                    let chunk: StreamChunk = match serde_json::from_str(payload) {
                        Ok(c) => c,
                        Err(e) => {
                            let _ = tx
                                .send(Err(EngineError::Protocol(format!(
                                    "bad SSE chunk: {e}"
                                ))))
                                .await;
                            return;
                        }
                    };

                    if let Some(usage) = chunk.usage {
                        prompt_tokens = usage.prompt_tokens;
                        completion_tokens = usage.completion_tokens;
                        usage_seen = true;
                        let _ = tx
                            .send(Ok(GenerationDelta::Usage {
                                input_tokens: prompt_tokens,
                                output_tokens: completion_tokens,
                                generation_secs: started.elapsed().as_secs_f64(),
                            }))
                            .await;
                        continue;
                    }

                    for choice in chunk.choices {
                        if let Some(content) = choice.delta.content {
                            if !content.is_empty()
                                && tx.send(Ok(GenerationDelta::Text(content))).await.is_err()
                            {
                                return;
                            }
                        }
                        if let Some(calls) = choice.delta.tool_calls {
                            for call in calls {
                                if let Some(function) = call.function {
                                    let delta = GenerationDelta::ToolCall {
                                        name: function.name.unwrap_or_default(),
                                        arguments: function.arguments.unwrap_or_default(),
                                    };
                                    if tx.send(Ok(delta)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        let _ = choice.finish_reason;
                    }
                }
            }

            // Stream ended without `[DONE]`; close with what we have.
            if !usage_seen {
                let _ = tx
                    .send(Ok(GenerationDelta::Usage {
                        input_tokens: prompt_tokens,
                        output_tokens: completion_tokens,
                        generation_secs: started.elapsed().as_secs_f64(),
                    }))
                    .await;
            }
        });

        Ok(rx)
    }

    async fn load(&self, model: &str, _params: &GenerateParams) -> Result<(), EngineError> {
        // No dynamic load on OpenAI-compatible servers; record intent.
        self.intended.lock().insert(model.to_string());
        debug!(model = %model, "recorded load intent (openai-compat)");
        Ok(())
    }

    async fn unload(&self, model: &str) -> Result<(), EngineError> {
        self.intended.lock().remove(model);
        debug!(model = %model, "recorded unload intent (openai-compat)");
        Ok(())
    }

    async fn list_loaded(&self) -> Result<HashSet<String>, EngineError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .auth(self.client.get(&url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| Self::map_send_error(e, Duration::from_secs(5)))?;

        let status = response.status().as_u16();
        if status >= 400 {
            warn!(status = status, "list-loaded query failed (openai-compat)");
            return Err(EngineError::Status {
                status,
                message: "models listing failed".into(),
            });
        }

        let models: ModelsResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }
}
