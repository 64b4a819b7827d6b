//! OpenAI-compatible chat-completions provider with SSE streaming.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use super::{Model, ModelEvent, ModelRequest, ModelStream, ToolCallRequest};
use crate::config::ModelConfig;
use crate::error::{ModelErrorKind, PithError};

/// Default endpoint for OpenAI chat completions.
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// Provider that talks to an OpenAI-compatible chat completions API.
#[derive(Debug)]
pub struct OpenAiModel {
    api_key: String,
    endpoint: String,
    model: String,
    client: Client,
}

impl OpenAiModel {
    /// Build the provider from operator config.
    ///
    /// The API key is resolved from the configured env var; a missing key
    /// is a config error so startup fails fast rather than the first turn.
    pub fn from_config(cfg: &ModelConfig) -> Result<Self, PithError> {
        let api_key = std::env::var(&cfg.api_key_env).map_err(|_| {
            PithError::Config(format!(
                "model API key env var {} is not set",
                cfg.api_key_env
            ))
        })?;
        let endpoint = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PithError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            api_key,
            endpoint,
            model: cfg.model.clone(),
            client,
        })
    }

    /// Explicit construction for tests and non-default endpoints.
    pub fn with_config(api_key: String, endpoint: String, model: String) -> Self {
        Self {
            api_key,
            endpoint,
            model,
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client"),
        }
    }
}

/// Map an HTTP status to transient/permanent model-error kinds.
fn kind_for_status(status: reqwest::StatusCode) -> ModelErrorKind {
    if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
        ModelErrorKind::Transient
    } else {
        ModelErrorKind::Permanent
    }
}

/// Partial tool-call accumulator keyed by stream index.
#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl Model for OpenAiModel {
    fn name(&self) -> &str {
        "openai"
    }

    fn stream_turn(&self, req: ModelRequest) -> ModelStream {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        let model = self.model.clone();

        Box::pin(async_stream::try_stream! {
            let mut body = json!({
                "model": model,
                "messages": super::serialize_messages(&req.system_prompt, &req.messages),
                "temperature": req.temperature,
                "stream": true,
            });
            if !req.tools.is_empty() {
                body["tools"] = Value::Array(super::serialize_tools(&req.tools));
                body["tool_choice"] = json!("auto");
            }

            let resp = client
                .post(&endpoint)
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| PithError::Model {
                    kind: ModelErrorKind::Transient,
                    detail: format!("request failed: {e}"),
                })?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                Err(PithError::Model {
                    kind: kind_for_status(status),
                    detail: format!("provider returned {status}: {text}"),
                })?;
                return;
            }

            // Parse SSE lines incrementally; emit content deltas as they
            // arrive and accumulate tool-call fragments by index.
            use tokio_stream::StreamExt as _;
            let mut byte_stream = resp.bytes_stream();
            let mut buffer = String::new();
            let mut calls: BTreeMap<u64, PartialCall> = BTreeMap::new();

            'outer: while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk.map_err(|e| PithError::Model {
                    kind: ModelErrorKind::Transient,
                    detail: format!("stream read failed: {e}"),
                })?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer[..newline_pos].trim_end().to_string();
                    buffer = buffer[newline_pos + 1..].to_string();

                    if line.is_empty() || !line.starts_with("data: ") {
                        continue;
                    }
                    let data = &line[6..];
                    if data == "[DONE]" {
                        break 'outer;
                    }
                    let Ok(payload) = serde_json::from_str::<Value>(data) else {
                        continue;
                    };
                    let delta = &payload["choices"][0]["delta"];

                    if let Some(content) = delta["content"].as_str() {
                        if !content.is_empty() {
                            yield ModelEvent::TextDelta(content.to_string());
                        }
                    }
                    if let Some(tool_calls) = delta["tool_calls"].as_array() {
                        for tc in tool_calls {
                            let index = tc["index"].as_u64().unwrap_or(0);
                            let entry = calls.entry(index).or_default();
                            if let Some(id) = tc["id"].as_str() {
                                entry.id.push_str(id);
                            }
                            if let Some(name) = tc["function"]["name"].as_str() {
                                entry.name.push_str(name);
                            }
                            if let Some(args) = tc["function"]["arguments"].as_str() {
                                entry.arguments.push_str(args);
                            }
                        }
                    }
                }
            }

            for (index, partial) in calls {
                if partial.name.is_empty() {
                    continue;
                }
                let args = serde_json::from_str(&partial.arguments)
                    .unwrap_or_else(|_| json!({}));
                let id = if partial.id.is_empty() {
                    format!("call_{index}")
                } else {
                    partial.id
                };
                yield ModelEvent::ToolCall(ToolCallRequest {
                    id,
                    name: partial.name,
                    args,
                });
            }
        })
    }
}
