//! Wire-adjacent request/response shapes for the chat transport.

use serde::{Deserialize, Serialize};

use roundtable_core::Role;

/// One message in a chat request, from the perspective of whichever agent
/// is about to send it — distinct from [`roundtable_core::Message`], which
/// is the persisted room/context record. `TurnEngine` converts one into the
/// other when it builds a hop's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// A tool exposed to the model, OpenAI function-calling shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Request to the provider. `stream` is set by the caller (`chat_once` always
/// sets it true; `summarize_once` always sets it false).
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice_auto: bool,
    pub temperature: f32,
    pub num_ctx: Option<u32>,
    pub keep_alive: Option<String>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            tools: Vec::new(),
            tool_choice_auto: false,
            temperature: 0.7,
            num_ctx: None,
            keep_alive: None,
        }
    }
}

/// One tool call, fully aggregated across whatever chunks carried its
/// fragments — incremental `delta.tool_calls` entries merged by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Result of one `chat_once` call.
#[derive(Debug, Clone, Default)]
pub struct AssistantMessage {
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallResult>,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: String,
    pub censored: bool,
    pub censor_reason: Option<String>,
}
