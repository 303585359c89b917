//! Two wire-format parsers funneling into one [`ChunkDelta`] shape:
//! OpenAI-compatible `data: {json}` SSE with `delta.content`/`delta.tool_calls`,
//! and provider-native bare-JSON-per-line with `message.{content,tool_calls}`
//! plus a top-level `done` flag.

use serde::Deserialize;

use crate::stream::ChunkDelta;

/// Yields [`ChunkDelta`]s from a stream one raw line at a time, regardless
/// of which wire format is speaking.
pub trait StreamParser: Send {
    fn feed_line(&mut self, line: &str) -> Vec<ChunkDelta>;
}

#[derive(Default)]
pub struct OpenAiSseParser {
    model: String,
    tokens_in: u32,
    tokens_out: u32,
    stop_reason: String,
}

impl OpenAiSseParser {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Deserialize, Default)]
struct OpenAiChunk {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize, Default)]
struct OpenAiChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiDelta {
    content: Option<String>,
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCallFragment>,
}

#[derive(Deserialize)]
struct OpenAiToolCallFragment {
    index: usize,
    id: Option<String>,
    function: Option<OpenAiFunctionFragment>,
}

#[derive(Deserialize, Default)]
struct OpenAiFunctionFragment {
    name: Option<String>,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

impl StreamParser for OpenAiSseParser {
    fn feed_line(&mut self, line: &str) -> Vec<ChunkDelta> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return Vec::new();
        }
        let Some(data) = line.strip_prefix("data:") else {
            return Vec::new();
        };
        let data = data.trim();
        if data == "[DONE]" {
            return vec![ChunkDelta::Done {
                model: self.model.clone(),
                tokens_in: self.tokens_in,
                tokens_out: self.tokens_out,
                stop_reason: self.stop_reason.clone(),
            }];
        }

        match serde_json::from_str::<OpenAiChunk>(data) {
            Ok(chunk) => {
                if !chunk.model.is_empty() {
                    self.model = chunk.model;
                }
                if let Some(usage) = &chunk.usage {
                    if let Some(p) = usage.prompt_tokens {
                        self.tokens_in = p;
                    }
                    if let Some(c) = usage.completion_tokens {
                        self.tokens_out = c;
                    }
                }
                let mut deltas = Vec::new();
                for choice in chunk.choices {
                    if let Some(reason) = choice.finish_reason {
                        self.stop_reason = reason;
                    }
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            deltas.push(ChunkDelta::Content { text: content });
                        }
                    }
                    if let Some(reasoning) = choice.delta.reasoning {
                        if !reasoning.is_empty() {
                            deltas.push(ChunkDelta::Reasoning { text: reasoning });
                        }
                    }
                    for frag in choice.delta.tool_calls {
                        deltas.push(ChunkDelta::ToolCallFragment {
                            index: frag.index,
                            id: frag.id,
                            name: frag.function.as_ref().and_then(|f| f.name.clone()),
                            arguments_fragment: frag
                                .function
                                .map(|f| f.arguments)
                                .unwrap_or_default(),
                        });
                    }
                }
                deltas
            }
            Err(e) => vec![ChunkDelta::Error {
                message: format!("sse parse error: {e}"),
            }],
        }
    }
}

/// Provider-native (Ollama-shaped) parser: one complete JSON object per
/// line, no `data:` prefix, terminated by `"done": true` rather than a
/// sentinel line.
#[derive(Default)]
pub struct ProviderNativeParser {
    model: String,
}

impl ProviderNativeParser {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Deserialize, Default)]
struct NativeChunk {
    #[serde(default)]
    model: String,
    message: Option<NativeMessage>,
    #[serde(default)]
    done: bool,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
    done_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct NativeMessage {
    content: Option<String>,
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<NativeToolCall>,
}

#[derive(Deserialize)]
struct NativeToolCall {
    function: NativeFunction,
}

#[derive(Deserialize)]
struct NativeFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

fn normalize_native_arguments(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}

impl StreamParser for ProviderNativeParser {
    fn feed_line(&mut self, line: &str) -> Vec<ChunkDelta> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        let chunk: NativeChunk = match serde_json::from_str(line) {
            Ok(c) => c,
            Err(e) => {
                return vec![ChunkDelta::Error {
                    message: format!("native stream parse error: {e}"),
                }]
            }
        };
        if !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }

        let mut deltas = Vec::new();
        if let Some(message) = &chunk.message {
            if let Some(content) = &message.content {
                if !content.is_empty() {
                    deltas.push(ChunkDelta::Content {
                        text: content.clone(),
                    });
                }
            }
            if let Some(reasoning) = &message.reasoning {
                if !reasoning.is_empty() {
                    deltas.push(ChunkDelta::Reasoning {
                        text: reasoning.clone(),
                    });
                }
            }
            for (index, call) in message.tool_calls.iter().enumerate() {
                deltas.push(ChunkDelta::ToolCallFragment {
                    index,
                    id: None,
                    name: Some(call.function.name.clone()),
                    arguments_fragment: normalize_native_arguments(&call.function.arguments),
                });
            }
        }

        if chunk.done {
            deltas.push(ChunkDelta::Done {
                model: self.model.clone(),
                tokens_in: chunk.prompt_eval_count.unwrap_or(0),
                tokens_out: chunk.eval_count.unwrap_or(0),
                stop_reason: chunk.done_reason.unwrap_or_default(),
            });
        }
        deltas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_parser_emits_content_then_done() {
        let mut parser = OpenAiSseParser::new();
        let deltas = parser.feed_line(
            r#"data: {"model":"gpt-x","choices":[{"delta":{"content":"hi"}}]}"#,
        );
        assert_eq!(deltas, vec![ChunkDelta::Content { text: "hi".into() }]);

        let done = parser.feed_line("data: [DONE]");
        match &done[0] {
            ChunkDelta::Done { model, .. } => assert_eq!(model, "gpt-x"),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn openai_parser_aggregates_tool_call_fragments_by_index() {
        let mut parser = OpenAiSseParser::new();
        let first = parser.feed_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"sh","arguments":"{\"cmd\":"}}]}}]}"#,
        );
        let second = parser.feed_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"echo hi\"}"}}]}}]}"#,
        );
        match &first[0] {
            ChunkDelta::ToolCallFragment { index, id, .. } => {
                assert_eq!(*index, 0);
                assert_eq!(id.as_deref(), Some("call_1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn native_parser_emits_done_on_done_flag() {
        let mut parser = ProviderNativeParser::new();
        let mid = parser.feed_line(r#"{"model":"llama3","message":{"content":"hel"},"done":false}"#);
        assert_eq!(mid, vec![ChunkDelta::Content { text: "hel".into() }]);

        let done = parser.feed_line(
            r#"{"model":"llama3","done":true,"prompt_eval_count":10,"eval_count":5,"done_reason":"stop"}"#,
        );
        match &done[0] {
            ChunkDelta::Done {
                model,
                tokens_in,
                tokens_out,
                stop_reason,
            } => {
                assert_eq!(model, "llama3");
                assert_eq!(*tokens_in, 10);
                assert_eq!(*tokens_out, 5);
                assert_eq!(stop_reason, "stop");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn native_parser_normalizes_tool_call_arguments() {
        let mut parser = ProviderNativeParser::new();
        let deltas = parser.feed_line(
            r#"{"message":{"tool_calls":[{"function":{"name":"sh","arguments":{"cmd":"ls"}}}]},"done":false}"#,
        );
        match &deltas[0] {
            ChunkDelta::ToolCallFragment {
                name,
                arguments_fragment,
                ..
            } => {
                assert_eq!(name.as_deref(), Some("sh"));
                assert!(arguments_fragment.contains("\"cmd\""));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
