//! Model provider abstraction.
//!
//! A [`Model`] turns an assembled prompt plus tool schemas into a stream
//! of [`ModelEvent`]s: text deltas as they arrive, then any tool-call
//! requests the model decided to make. The runtime never talks to a
//! provider API directly.

pub mod mock;
pub mod openai;

use std::pin::Pin;

use futures_core::Stream;
use serde_json::Value;

use crate::error::PithError;

/// A chat message as sent to the provider.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// `"system"`, `"user"`, `"assistant"`, or `"tool"`.
    pub role: String,
    pub content: String,
    /// For assistant messages that carry tool calls: `(id, name, args)`.
    pub tool_calls: Option<Vec<(String, String, Value)>>,
    /// For `tool` role messages: the id of the call this result answers.
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Plain message without tool metadata.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Schema for one tool exposed to the provider.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema object for the arguments.
    pub parameters: Value,
}

/// A tool call the model asked for.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// One item in a streamed model response.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    /// A fragment of assistant text.
    TextDelta(String),
    /// A complete tool-call request (emitted once fully accumulated).
    ToolCall(ToolCallRequest),
}

/// Everything a provider needs for one model round-trip.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    pub temperature: f32,
}

/// Boxed stream of model events.
pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, PithError>> + Send>>;

/// Abstract language-model provider.
pub trait Model: Send + Sync {
    /// Provider identifier for logging and `/status`.
    fn name(&self) -> &str;

    /// Run one model call in streaming mode.
    ///
    /// Text deltas arrive in order; tool-call requests follow once their
    /// arguments are complete. The stream ends after the terminal event.
    fn stream_turn(&self, req: ModelRequest) -> ModelStream;
}

/// Serialise messages into the OpenAI-compatible wire format.
pub fn serialize_messages(system_prompt: &str, messages: &[ChatMessage]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        out.push(serde_json::json!({ "role": "system", "content": system_prompt }));
    }
    for m in messages {
        let mut msg = serde_json::json!({ "role": m.role });
        if let Some(ref calls) = m.tool_calls {
            let tc: Vec<Value> = calls
                .iter()
                .map(|(id, name, args)| {
                    serde_json::json!({
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": args.to_string() }
                    })
                })
                .collect();
            msg["tool_calls"] = Value::Array(tc);
            // Providers expect null content on tool-call messages.
            msg["content"] = if m.content.is_empty() {
                Value::Null
            } else {
                Value::String(m.content.clone())
            };
        } else {
            msg["content"] = Value::String(m.content.clone());
        }
        if let Some(ref id) = m.tool_call_id {
            msg["tool_call_id"] = Value::String(id.clone());
        }
        out.push(msg);
    }
    out
}

/// Serialise tool schemas into the OpenAI `tools` array.
pub fn serialize_tools(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}
