//! Streaming chat client: preflight, staged connect timeouts, SSE/provider-native
//! parse, idle/hard-stop watchdogs, per-chunk abort detection, and interrupt.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use roundtable_text::{DetectorContext, DetectorRegistry, Sanitizer};

use crate::error::ProviderError;
use crate::sse::{OpenAiSseParser, ProviderNativeParser, StreamParser};
use crate::stream::ChunkDelta;
use crate::wire::{AssistantMessage, ChatRequest, ToolCallResult};

const HOSTED_MARKERS: &[&str] = &["api.openai.com", "anthropic.com", "openrouter.ai"];

/// Lease-refresh hook, touched once per chunk while a stream is live.
/// Implemented for [`roundtable_sync::ChannelLock`] so a hop can prove
/// progress to the sweeper while it streams.
#[async_trait::async_trait]
pub trait LeaseTouch: Send + Sync {
    async fn touch(&self);
}

#[async_trait::async_trait]
impl LeaseTouch for roundtable_sync::ChannelLock {
    async fn touch(&self) {
        roundtable_sync::ChannelLock::touch(self).await;
    }
}

/// Per-call options: the abort-detector panel to run, the context those
/// detectors need, and the optional lease-touch hook.
pub struct ChatOpts<'a> {
    pub detectors: &'a DetectorRegistry,
    pub known_agents: &'a [String],
    pub soc_sample: &'a str,
    pub on_data: Option<Arc<dyn LeaseTouch>>,
}

#[derive(Default)]
struct ToolCallAgg {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

fn merge_fragment(
    map: &mut BTreeMap<usize, ToolCallAgg>,
    index: usize,
    id: Option<String>,
    name: Option<String>,
    arguments_fragment: String,
) {
    let entry = map.entry(index).or_default();
    if id.is_some() {
        entry.id = id;
    }
    if name.is_some() {
        entry.name = name;
    }
    entry.arguments.push_str(&arguments_fragment);
}

fn finalize_tool_calls(map: BTreeMap<usize, ToolCallAgg>) -> Vec<ToolCallResult> {
    map.into_iter()
        .map(|(index, agg)| ToolCallResult {
            id: agg.id.unwrap_or_else(|| format!("call_{index}")),
            name: agg.name.unwrap_or_default(),
            arguments: if agg.arguments.is_empty() {
                "{}".to_string()
            } else {
                agg.arguments
            },
        })
        .collect()
}

fn is_hosted(endpoint: &str) -> bool {
    HOSTED_MARKERS.iter().any(|m| endpoint.contains(m))
}

fn build_body(req: &ChatRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
        .collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "stream": req.stream,
        "temperature": req.temperature,
    });

    if let Some(ctx) = req.num_ctx {
        body["num_ctx"] = serde_json::json!(ctx);
    }
    if let Some(keep_alive) = &req.keep_alive {
        body["keep_alive"] = serde_json::json!(keep_alive);
    }
    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
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
            .collect();
        body["tools"] = serde_json::json!(tools);
        if req.tool_choice_auto {
            body["tool_choice"] = serde_json::json!("auto");
        }
    }
    body
}

fn parse_single_completion(text: &str) -> Result<AssistantMessage, ProviderError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProviderError::Parse(e.to_string()))?;

    if let Some(choices) = value.get("choices").and_then(|c| c.as_array()) {
        let choice = choices.first();
        let message = choice.and_then(|c| c.get("message"));
        let content = message
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();
        let model = value
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let stop_reason = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let tokens_in = value
            .get("usage")
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        let tokens_out = value
            .get("usage")
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        let tool_calls = message
            .and_then(|m| m.get("tool_calls"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        let id = tc
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("call_0")
                            .to_string();
                        let function = tc.get("function")?;
                        let name = function.get("name").and_then(|v| v.as_str())?.to_string();
                        let arguments = function
                            .get("arguments")
                            .and_then(|v| v.as_str())
                            .unwrap_or("{}")
                            .to_string();
                        Some(ToolCallResult {
                            id,
                            name,
                            arguments,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(AssistantMessage {
            content,
            reasoning: String::new(),
            tool_calls,
            model,
            tokens_in,
            tokens_out,
            stop_reason,
            censored: false,
            censor_reason: None,
        })
    } else {
        let message = value.get("message");
        let content = message
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let model = value
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        Ok(AssistantMessage {
            content,
            model,
            ..Default::default()
        })
    }
}

/// Streaming LLM client. Holds a `reqwest::Client` and the ordered list of
/// candidate base URLs (primary, then fallbacks).
pub struct ChatTransport {
    client: reqwest::Client,
    endpoints: Vec<String>,
    connect_stages: Vec<Duration>,
    current_cancel: AsyncMutex<CancellationToken>,
}

impl ChatTransport {
    pub fn new(endpoints: Vec<String>, connect_stages: Vec<Duration>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
            connect_stages,
            current_cancel: AsyncMutex::new(CancellationToken::new()),
        }
    }

    /// Auxiliary provider-native preflight (`GET /api/version`, `/api/tags`).
    /// Skipped for hosted providers or when `force_v1` is configured.
    pub async fn preflight(&self, force_v1: bool) -> bool {
        if force_v1 {
            return true;
        }
        let Some(endpoint) = self.endpoints.first() else {
            return true;
        };
        if is_hosted(endpoint) {
            return true;
        }
        for path in ["/api/version", "/api/tags"] {
            let url = format!("{endpoint}{path}");
            match self
                .client
                .get(&url)
                .timeout(Duration::from_secs(5))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return true,
                _ => continue,
            }
        }
        warn!(endpoint = %endpoint, "chat transport: preflight failed on all probes");
        false
    }

    /// Cancel the in-flight stream, if any.
    pub async fn interrupt_chat(&self) {
        self.current_cancel.lock().await.cancel();
    }

    /// Stream one completion. Never returns `Err` for ordinary provider
    /// unavailability — a degraded assistant message is returned instead so
    /// the turn engine always has something to work with; genuine transport
    /// errors (cancellation aside) are logged and folded into that degraded
    /// message.
    pub async fn chat_once(
        &self,
        agent_id: &str,
        mut req: ChatRequest,
        opts: ChatOpts<'_>,
        idle_timeout: Duration,
        hard_stop: Duration,
    ) -> Result<AssistantMessage, ProviderError> {
        req.stream = true;
        let cancel = CancellationToken::new();
        *self.current_cancel.lock().await = cancel.clone();

        let mut last_err = None;
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let stage = self
                .connect_stages
                .get(i)
                .copied()
                .unwrap_or_else(|| *self.connect_stages.last().unwrap_or(&Duration::from_secs(5)));
            match self
                .try_stream(agent_id, endpoint, &req, stage, idle_timeout, hard_stop, &opts, &cancel)
                .await
            {
                Ok(msg) => return Ok(msg),
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "chat transport: endpoint attempt failed");
                    last_err = Some(e);
                }
            }
        }

        info!(agent_id = %agent_id, error = ?last_err.map(|e| e.to_string()), "chat transport: all endpoints exhausted");
        Ok(AssistantMessage {
            content: "The assistant is warming up or temporarily unavailable.".to_string(),
            stop_reason: "unavailable".to_string(),
            ..Default::default()
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_stream(
        &self,
        agent_id: &str,
        endpoint: &str,
        req: &ChatRequest,
        first_chunk_timeout: Duration,
        idle_timeout: Duration,
        hard_stop: Duration,
        opts: &ChatOpts<'_>,
        cancel: &CancellationToken,
    ) -> Result<AssistantMessage, ProviderError> {
        let url = format!("{endpoint}/v1/chat/completions");
        let body = build_body(req);
        debug!(agent_id = %agent_id, %url, "chat transport: posting request");

        let resp = tokio::select! {
            r = self.client.post(&url).json(&body).send() => r?,
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            _ = tokio::time::sleep(first_chunk_timeout) => {
                return Err(ProviderError::Unavailable("connect timeout".to_string()));
            }
        };

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("application/json") {
            let text = resp.text().await.map_err(ProviderError::Http)?;
            return parse_single_completion(&text);
        }

        let mut parser: Box<dyn StreamParser> = if content_type.contains("event-stream") {
            Box::new(OpenAiSseParser::new())
        } else {
            Box::new(ProviderNativeParser::new())
        };

        let mut byte_stream = resp.bytes_stream();
        let mut line_buf = String::new();
        let mut sanitizer = Sanitizer::new();
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_frags: BTreeMap<usize, ToolCallAgg> = BTreeMap::new();
        let hard_deadline = Instant::now() + hard_stop;
        let mut first = true;

        loop {
            let per_chunk_timeout = if first { first_chunk_timeout } else { idle_timeout };
            let chunk = tokio::select! {
                c = byte_stream.next() => c,
                _ = tokio::time::sleep(per_chunk_timeout) => {
                    return Err(ProviderError::Unavailable(if first {
                        "first-chunk timeout".to_string()
                    } else {
                        "idle stream timeout".to_string()
                    }));
                }
                _ = tokio::time::sleep_until(hard_deadline) => {
                    return Err(ProviderError::Unavailable("hard stop".to_string()));
                }
                _ = cancel.cancelled() => {
                    return Err(ProviderError::Cancelled);
                }
            };
            first = false;

            let Some(chunk) = chunk else {
                break;
            };
            let bytes = chunk.map_err(ProviderError::Http)?;
            line_buf.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=pos).collect();
                let sanitized = sanitizer.sanitize_chunk(line.trim_end());

                for delta in parser.feed_line(&sanitized) {
                    match delta {
                        ChunkDelta::Content { text } => {
                            content.push_str(&text);
                            if let Some(hook) = &opts.on_data {
                                hook.touch().await;
                            }
                            let ctx = DetectorContext {
                                known_agents: opts.known_agents,
                                soc_sample: opts.soc_sample,
                            };
                            if let Some(hit) = opts.detectors.check(&content, &ctx) {
                                content.truncate(hit.index.min(content.len()));
                                warn!(agent_id = %agent_id, reason = %hit.reason, "chat transport: abort detector tripped");
                                return Ok(AssistantMessage {
                                    content,
                                    reasoning,
                                    tool_calls: finalize_tool_calls(tool_frags),
                                    model: req.model.clone(),
                                    censored: true,
                                    censor_reason: Some(hit.reason),
                                    ..Default::default()
                                });
                            }
                        }
                        ChunkDelta::Reasoning { text } => reasoning.push_str(&text),
                        ChunkDelta::ToolCallFragment {
                            index,
                            id,
                            name,
                            arguments_fragment,
                        } => merge_fragment(&mut tool_frags, index, id, name, arguments_fragment),
                        ChunkDelta::Done {
                            model,
                            tokens_in,
                            tokens_out,
                            stop_reason,
                        } => {
                            return Ok(AssistantMessage {
                                content,
                                reasoning,
                                tool_calls: finalize_tool_calls(tool_frags),
                                model,
                                tokens_in,
                                tokens_out,
                                stop_reason,
                                censored: false,
                                censor_reason: None,
                            });
                        }
                        ChunkDelta::Error { message } => return Err(ProviderError::Parse(message)),
                    }
                }
            }
        }

        Ok(AssistantMessage {
            content,
            reasoning,
            tool_calls: finalize_tool_calls(tool_frags),
            model: req.model.clone(),
            ..Default::default()
        })
    }

    /// Non-streaming auxiliary call, used for compaction summaries.
    pub async fn summarize_once(
        &self,
        mut req: ChatRequest,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        req.stream = false;
        let body = build_body(&req);

        for endpoint in &self.endpoints {
            let url = format!("{endpoint}/v1/chat/completions");
            let send = self.client.post(&url).json(&body).send();
            match tokio::time::timeout(timeout, send).await {
                Ok(Ok(resp)) if resp.status().is_success() => {
                    let text = resp.text().await.map_err(ProviderError::Http)?;
                    return parse_single_completion(&text).map(|m| m.content);
                }
                Ok(Ok(resp)) => {
                    warn!(endpoint = %endpoint, status = %resp.status(), "summarize: non-success response");
                }
                Ok(Err(e)) => warn!(endpoint = %endpoint, error = %e, "summarize: request failed"),
                Err(_) => warn!(endpoint = %endpoint, "summarize: timed out"),
            }
        }
        Err(ProviderError::Unavailable(
            "no summarize endpoint reachable".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_tool_calls_assigns_fallback_id_and_sorts_by_index() {
        let mut map = BTreeMap::new();
        merge_fragment(&mut map, 1, None, Some("b".into()), "{}".into());
        merge_fragment(&mut map, 0, Some("call_x".into()), Some("a".into()), "{}".into());
        let calls = finalize_tool_calls(map);
        assert_eq!(calls[0].id, "call_x");
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[1].id, "call_1");
        assert_eq!(calls[1].name, "b");
    }

    #[test]
    fn parse_single_completion_handles_openai_shape() {
        let text = r#"{"model":"gpt-x","choices":[{"message":{"content":"hi"},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":1}}"#;
        let msg = parse_single_completion(text).unwrap();
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.tokens_in, 3);
        assert_eq!(msg.stop_reason, "stop");
    }

    #[test]
    fn parse_single_completion_handles_native_shape() {
        let text = r#"{"model":"llama3","message":{"content":"hey"}}"#;
        let msg = parse_single_completion(text).unwrap();
        assert_eq!(msg.content, "hey");
        assert_eq!(msg.model, "llama3");
    }

    #[test]
    fn is_hosted_matches_known_providers() {
        assert!(is_hosted("https://api.openai.com"));
        assert!(!is_hosted("http://localhost:11434"));
    }
}
