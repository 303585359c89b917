//! The multi-hop tool/chat loop run once per turn, with per-hop abort
//! detection, duplicate-call debouncing, a breaker cooldown, tool-call caps,
//! and tag-triggered file/direct delivery.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use roundtable_core::{Audience, ChatRoom, Message, Role};
use roundtable_sync::{PauseController, TransportGate};
use roundtable_text::tags::{Tag, TagKind};
use roundtable_text::{tags, tool_calls, DetectorRegistry};
use roundtable_tools::{FileWriter, ToolAdapter};
use roundtable_transport::{
    AssistantMessage, ChatMessage, ChatOpts, ChatRequest, ChatTransport, LeaseTouch,
    ToolCallResult, ToolDefinition,
};

/// Everything a hop loop run needs, borrowed from the owning [`crate::engine::TurnEngine`].
#[allow(clippy::too_many_arguments)]
pub struct HopLoopContext<'a> {
    pub agent_id: &'a str,
    pub model: &'a str,
    pub room: &'a ChatRoom,
    pub transport: &'a ChatTransport,
    pub gate: &'a Arc<TransportGate>,
    pub tool_adapter: &'a dyn ToolAdapter,
    pub file_writer: &'a dyn FileWriter,
    pub detectors: &'a DetectorRegistry,
    pub pause: &'a PauseController,
    pub lease: Arc<dyn LeaseTouch>,
    pub known_agents: &'a [String],
    pub soc_sample: &'a str,
    pub tools: &'a [ToolDefinition],
    pub max_hops: usize,
    pub max_tool_calls_per_turn: usize,
    pub hop_timeout: Duration,
    pub idle_stream_ms: Duration,
    pub hard_stop_ms: Duration,
    pub user_interject_window_ms: i64,
    pub now_ms: i64,
}

/// Everything produced in one turn's hop loop: the messages to append to
/// this agent's context, whether a file was written, and the audience the
/// final output should be delivered to.
pub struct HopLoopOutcome {
    pub produced: Vec<Message>,
    pub wrote_file: bool,
    pub final_audience: Audience,
}

fn mk_message(
    from: &str,
    role: Role,
    content: impl Into<String>,
    now_ms: i64,
    tool_name: Option<String>,
    tool_call_id: Option<String>,
) -> Message {
    Message {
        seq: 0,
        ts_ms: now_ms,
        from: from.to_string(),
        to: None,
        role,
        content: content.into(),
        tool_call_id,
        tool_name,
        reasoning: None,
        read: true,
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_signature(name: &str, arguments: &str) -> String {
    let normalized_args = if name == "sh" {
        collapse_whitespace(arguments)
    } else {
        arguments.to_string()
    };
    format!("{name}|{normalized_args}")
}

fn extract_cmd(arguments: &str) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(arguments) {
        if let Some(serde_json::Value::String(cmd)) = map.get("cmd") {
            return cmd.clone();
        }
    }
    arguments.to_string()
}

fn push_recent_signature(recent: &mut VecDeque<String>, signature: String) {
    if recent.len() >= 6 {
        recent.pop_front();
    }
    recent.push_back(signature);
}

async fn process_tags(
    ctx: &HopLoopContext<'_>,
    tags: &[Tag],
    wrote_file: &mut bool,
    audience: &mut Audience,
    out: &mut Vec<Message>,
) {
    for tag in tags {
        match &tag.kind {
            TagKind::File(path) => match ctx.file_writer.write(path, &tag.content) {
                Ok(()) => {
                    *wrote_file = true;
                    *audience = Audience::File(path.clone());
                    out.push(mk_message(
                        ctx.agent_id,
                        Role::Tool,
                        format!("wrote {path}"),
                        ctx.now_ms,
                        Some("write_file".to_string()),
                        None,
                    ));
                }
                Err(e) => {
                    warn!(agent_id = %ctx.agent_id, path = %path, error = %e, "hop loop: file write failed");
                    out.push(mk_message(
                        ctx.agent_id,
                        Role::Tool,
                        format!("write failed for {path}: {e}"),
                        ctx.now_ms,
                        Some("write_file".to_string()),
                        None,
                    ));
                }
            },
            TagKind::Agent(name) => {
                ctx.room.send_to(ctx.agent_id, name, &tag.content, ctx.now_ms).await;
                *audience = Audience::Direct(name.clone());
            }
        }
    }
}

async fn call_hop(
    ctx: &HopLoopContext<'_>,
    history: &[ChatMessage],
    tools_enabled: bool,
    temperature_bump: f32,
    hop: usize,
) -> AssistantMessage {
    let mut req = ChatRequest::new(ctx.model, history.to_vec());
    req.temperature += temperature_bump;
    if tools_enabled && !ctx.tools.is_empty() {
        req.tools = ctx.tools.to_vec();
        req.tool_choice_auto = true;
    }

    let opts = ChatOpts {
        detectors: ctx.detectors,
        known_agents: ctx.known_agents,
        soc_sample: ctx.soc_sample,
        on_data: Some(ctx.lease.clone()),
    };

    let guard = ctx.gate.acquire(format!("{}-hop{hop}", ctx.agent_id)).await;
    let result = tokio::time::timeout(
        ctx.hop_timeout,
        ctx.transport
            .chat_once(ctx.agent_id, req, opts, ctx.idle_stream_ms, ctx.hard_stop_ms),
    )
    .await;
    guard.release().await;

    match result {
        Ok(Ok(msg)) => msg,
        Ok(Err(e)) => {
            warn!(agent_id = %ctx.agent_id, error = %e, "hop loop: transport error");
            AssistantMessage::default()
        }
        Err(_) => {
            warn!(agent_id = %ctx.agent_id, "hop loop: hop timed out");
            AssistantMessage::default()
        }
    }
}

/// Run the full multi-hop loop, mutating `history` in place as hops
/// accumulate turns (so a later hop sees everything said so far).
pub async fn run_hop_loop(ctx: &HopLoopContext<'_>, mut history: Vec<ChatMessage>) -> HopLoopOutcome {
    let mut produced = Vec::new();
    let mut wrote_file = false;
    let mut audience = Audience::Group;
    let mut recent_signatures: VecDeque<String> = VecDeque::with_capacity(6);
    let mut breaker: u8 = 0;
    let mut tool_calls_this_turn = 0usize;

    'hops: for hop in 0..ctx.max_hops {
        if ctx.pause.recently_interjected(ctx.now_ms, ctx.user_interject_window_ms) {
            produced.push(mk_message(
                "system",
                Role::System,
                "yielding to user interjection",
                ctx.now_ms,
                None,
                None,
            ));
            break;
        }

        let tools_enabled = breaker == 0;
        let remaining_calls = ctx.max_tool_calls_per_turn.saturating_sub(tool_calls_this_turn);
        history.push(ChatMessage {
            role: Role::System,
            content: format!(
                "You have {remaining_calls} tool call(s) remaining this turn. Prefer #file:<path> writes when producing file content."
            ),
        });

        let mut response = call_hop(ctx, &history, tools_enabled, 0.0, hop).await;

        if response.content.trim().is_empty() && response.tool_calls.is_empty() {
            response = call_hop(ctx, &history, tools_enabled, 0.3, hop).await;
            if response.content.trim().is_empty() && response.tool_calls.is_empty() {
                produced.push(mk_message(
                    "system",
                    Role::System,
                    "assistant returned no content twice in a row",
                    ctx.now_ms,
                    None,
                    None,
                ));
                breaker = 1;
                if breaker > 0 {
                    history.push(ChatMessage {
                        role: Role::System,
                        content: "tool loop breaker engaged: tools disabled for the next hop".to_string(),
                    });
                    breaker -= 1;
                }
                continue;
            }
        }

        let tag_result = tags::parse(&response.content);
        let extraction = tool_calls::extract(&tag_result.cleaned);

        let mut all_tool_calls = response.tool_calls.clone();
        for extracted in extraction.calls {
            let synthetic_id = format!("embedded_{}", all_tool_calls.len());
            all_tool_calls.push(ToolCallResult {
                id: synthetic_id,
                name: extracted.name,
                arguments: extracted.arguments,
            });
        }

        let visible_text = extraction.cleaned.trim().to_string();

        if all_tool_calls.is_empty() {
            let final_text = if visible_text.is_empty() {
                "Understood.".to_string()
            } else {
                visible_text
            };
            history.push(ChatMessage {
                role: Role::Assistant,
                content: final_text.clone(),
            });
            produced.push(mk_message(ctx.agent_id, Role::Assistant, final_text, ctx.now_ms, None, None));
            process_tags(ctx, &tag_result.tags, &mut wrote_file, &mut audience, &mut produced).await;
            break;
        }

        if !visible_text.is_empty() {
            history.push(ChatMessage {
                role: Role::Assistant,
                content: visible_text.clone(),
            });
            produced.push(mk_message(ctx.agent_id, Role::Assistant, visible_text, ctx.now_ms, None, None));
        }

        let mut same_hop_seen: std::collections::HashSet<String> = std::collections::HashSet::new();

        for call in all_tool_calls {
            if tool_calls_this_turn >= ctx.max_tool_calls_per_turn {
                produced.push(mk_message(
                    "system",
                    Role::System,
                    "tool call cap reached for this turn",
                    ctx.now_ms,
                    None,
                    None,
                ));
                break;
            }

            let signature = normalize_signature(&call.name, &call.arguments);

            if same_hop_seen.contains(&signature) {
                produced.push(mk_message(
                    ctx.agent_id,
                    Role::Assistant,
                    "aborted duplicate tool call in the same hop",
                    ctx.now_ms,
                    None,
                    None,
                ));
                breaker = 1;
                break;
            }
            if recent_signatures.contains(&signature) {
                produced.push(mk_message(
                    "system",
                    Role::System,
                    format!("skipping recently repeated tool call: {}", call.name),
                    ctx.now_ms,
                    None,
                    None,
                ));
                breaker = 1;
                continue;
            }

            same_hop_seen.insert(signature.clone());
            push_recent_signature(&mut recent_signatures, signature);

            let (ok, content, tool_name) = if call.name == "sh" {
                let cmd = extract_cmd(&call.arguments);
                let shell = ctx.tool_adapter.execute(&cmd, CancellationToken::new()).await;
                let rendered = if shell.ok {
                    shell.stdout
                } else {
                    format!("{}{}", shell.stdout, shell.stderr)
                };
                (shell.ok, rendered, "sh".to_string())
            } else {
                (false, format!("unknown tool: {}", call.name), call.name.clone())
            };

            history.push(ChatMessage {
                role: Role::Tool,
                content: content.clone(),
            });
            produced.push(mk_message(
                ctx.agent_id,
                Role::Tool,
                content,
                ctx.now_ms,
                Some(tool_name),
                Some(call.id.clone()),
            ));
            let _ = ok;
            tool_calls_this_turn += 1;
        }

        process_tags(ctx, &tag_result.tags, &mut wrote_file, &mut audience, &mut produced).await;

        let remaining_after = ctx.max_tool_calls_per_turn.saturating_sub(tool_calls_this_turn);
        if remaining_after <= 2 && !wrote_file {
            history.push(ChatMessage {
                role: Role::System,
                content: "nearly exhausted tool calls; prefer writing output via #file:<path> now".to_string(),
            });
        }

        if breaker > 0 {
            history.push(ChatMessage {
                role: Role::System,
                content: "tool loop breaker engaged: tools disabled for the next hop".to_string(),
            });
            breaker -= 1;
        }

        if tool_calls_this_turn >= ctx.max_tool_calls_per_turn {
            break 'hops;
        }
    }

    if produced.is_empty() {
        produced.push(mk_message(ctx.agent_id, Role::Assistant, "(no content)", ctx.now_ms, None, None));
    }

    HopLoopOutcome {
        produced,
        wrote_file,
        final_audience: audience,
    }
}
