//! Locally-managed native engine adapter.
//!
//! Speaks `/api/chat` with newline-delimited JSON streaming, `/api/ps`
//! for list-loaded, and unloads by posting a generate with
//! `keep_alive: 0`. This is the only engine kind the orchestrator can
//! truly evict from.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gantry_kernel::error::EngineError;
use gantry_kernel::model::EngineKind;

use super::{EngineAdapter, EngineMessage, GenerateParams, GenerationDelta, TokenStream};

const DEFAULT_DEADLINE: Duration = Duration::from_secs(300);
/// Loads block until the engine has mapped the weights; give them room.
const LOAD_TIMEOUT: Duration = Duration::from_secs(600);

pub struct NativeEngine {
    base_url: String,
    client: Client,
}

impl NativeEngine {
    pub fn new(base_url: impl Into<String>) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::Protocol(format!("client build failed: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
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

/// One NDJSON line from `/api/chat`.
#[derive(Debug, Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    /// Total wall-time in nanoseconds, reported on the final line.
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Option<Vec<LineToolCall>>,
}

#[derive(Debug, Deserialize)]
struct LineToolCall {
    #[serde(default)]
    function: Option<LineFunction>,
}

#[derive(Debug, Deserialize)]
struct LineFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<PsModel>,
}

#[derive(Debug, Deserialize)]
struct PsModel {
    name: String,
}

#[async_trait]
impl EngineAdapter for NativeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Native
    }

    async fn generate(
        &self,
        model: &str,
        messages: &[EngineMessage],
        params: &GenerateParams,
    ) -> Result<TokenStream, EngineError> {
        let deadline = params.deadline.unwrap_or(DEFAULT_DEADLINE);
        let url = format!("{}/api/chat", self.base_url);

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });
        let mut options = serde_json::Map::new();
        if let Some(t) = params.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(max) = params.max_tokens {
            options.insert("num_predict".into(), json!(max));
        }
        if !options.is_empty() {
            body["options"] = serde_json::Value::Object(options);
        }
        if let Some(think) = params.thinking {
            body["think"] = json!(think);
        }
        if let Some(keep_alive) = &params.keep_alive {
            body["keep_alive"] = json!(keep_alive);
        }

        debug!(model = %model, url = %url, "starting NDJSON generation");
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
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

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }

                    let parsed: ChatLine = match serde_json::from_str(&line) {
                        Ok(p) => p,
                        Err(e) => {
                            let _ = tx
                                .send(Err(EngineError::Protocol(format!("bad NDJSON line: {e}"))))
                                .await;
                            return;
                        }
                    };

                    if let Some(error) = parsed.error {
                        let _ = tx
                            .send(Err(EngineError::Status {
                                status: 500,
                                message: error,
                            }))
                            .await;
                        return;
                    }

                    if let Some(message) = parsed.message {
                        if !message.content.is_empty()
                            && tx
                                .send(Ok(GenerationDelta::Text(message.content)))
                                .await
                                .is_err()
                        {
                            return;
                        }
                        if let Some(calls) = message.tool_calls {
                            for call in calls {
                                if let Some(function) = call.function {
                                    let delta = GenerationDelta::ToolCall {
                                        name: function.name,
                                        arguments: function.arguments.to_string(),
                                    };
                                    if tx.send(Ok(delta)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }

                    if parsed.done {
                        let generation_secs = parsed
                            .total_duration
                            .map(|ns| ns as f64 / 1e9)
                            .unwrap_or_else(|| started.elapsed().as_secs_f64());
                        let _ = tx
                            .send(Ok(GenerationDelta::Usage {
                                input_tokens: parsed.prompt_eval_count.unwrap_or(0),
                                output_tokens: parsed.eval_count.unwrap_or(0),
                                generation_secs,
                            }))
                            .await;
                        return;
                    }
                }
            }

            // Connection closed without a done line.
            let _ = tx
                .send(Err(EngineError::Protocol(
                    "stream ended without done marker".into(),
                )))
                .await;
        });

        Ok(rx)
    }

    async fn load(&self, model: &str, params: &GenerateParams) -> Result<(), EngineError> {
        // An empty generate maps the weights; keep_alive pins residency.
        let url = format!("{}/api/generate", self.base_url);
        let body = json!({
            "model": model,
            "keep_alive": params.keep_alive.clone().unwrap_or_else(|| "5m".into()),
        });

        info!(model = %model, "loading model into native engine");
        let response = self
            .client
            .post(&url)
            .timeout(LOAD_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::map_send_error(e, LOAD_TIMEOUT))?;

        let status = response.status().as_u16();
        if status >= 400 {
            let message = response.text().await.unwrap_or_default();
            return Err(EngineError::Status { status, message });
        }
        Ok(())
    }

    async fn unload(&self, model: &str) -> Result<(), EngineError> {
        // keep_alive: 0 releases the weights immediately.
        let url = format!("{}/api/generate", self.base_url);
        let body = json!({ "model": model, "keep_alive": 0 });

        info!(model = %model, "unloading model from native engine");
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(30))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::map_send_error(e, Duration::from_secs(30)))?;

        let status = response.status().as_u16();
        if status >= 400 {
            let message = response.text().await.unwrap_or_default();
            return Err(EngineError::Status { status, message });
        }
        Ok(())
    }

    async fn list_loaded(&self) -> Result<HashSet<String>, EngineError> {
        let url = format!("{}/api/ps", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| Self::map_send_error(e, Duration::from_secs(5)))?;

        let status = response.status().as_u16();
        if status >= 400 {
            warn!(status = status, "/api/ps returned an error");
            return Err(EngineError::Status {
                status,
                message: "ps query failed".into(),
            });
        }

        let ps: PsResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        let loaded: HashSet<String> = ps.models.into_iter().map(|m| m.name).collect();
        debug!(count = loaded.len(), "native engine reports loaded models");
        Ok(loaded)
    }

    async fn cleanup(&self) -> Result<(), EngineError> {
        // Nothing engine-side to do beyond the unload itself; the hint
        // exists for adapters that manage shared memory or caches.
        debug!("cleanup hint acknowledged (native)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndjson_line_parses_content() {
        let line = r#"{"message":{"content":"Hel"},"done":false}"#;
        let parsed: ChatLine = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.message.unwrap().content, "Hel");
        assert!(!parsed.done);
    }

    #[test]
    fn ndjson_final_line_carries_usage() {
        let line = r#"{"message":{"content":""},"done":true,"prompt_eval_count":11,"eval_count":57,"total_duration":2500000000}"#;
        let parsed: ChatLine = serde_json::from_str(line).unwrap();
        assert!(parsed.done);
        assert_eq!(parsed.prompt_eval_count, Some(11));
        assert_eq!(parsed.eval_count, Some(57));
        assert_eq!(parsed.total_duration, Some(2_500_000_000));
    }

    #[test]
    fn ndjson_error_line() {
        let line = r#"{"error":"model not found"}"#;
        let parsed: ChatLine = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.error.as_deref(), Some("model not found"));
    }

    #[test]
    fn ps_response_parses_model_names() {
        let body = r#"{"models":[{"name":"gpt-oss:20b","size":13000000000},{"name":"rnj-1:8b"}]}"#;
        let ps: PsResponse = serde_json::from_str(body).unwrap();
        let names: Vec<&str> = ps.models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["gpt-oss:20b", "rnj-1:8b"]);
    }

    #[tokio::test]
    async fn unreachable_endpoint_maps_to_unreachable() {
        let engine = NativeEngine::new("http://127.0.0.1:1").unwrap();
        let err = engine.list_loaded().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Unreachable(_) | EngineError::Timeout(_)
        ));
    }
}
