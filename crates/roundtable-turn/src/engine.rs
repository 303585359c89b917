//! Per-agent turn engine: receive path, conditional summarization, the
//! multi-hop loop, delivery, and compaction — the full receive→deliver→compact
//! cycle held under one [`ChannelLock`] acquisition.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use roundtable_core::{AgentHandle, Audience, ChatRoom, Message, Role, RoundtableConfig};
use roundtable_sync::{ChannelLock, PauseController, TransportGate};
use roundtable_text::DetectorRegistry;
use roundtable_tools::{FileWriter, ToolAdapter};
use roundtable_transport::{ChatMessage, ChatRequest, ChatTransport, LeaseTouch, ToolDefinition};

use crate::compact::compact_context;
use crate::history::build_history;
use crate::hop::{run_hop_loop, HopLoopContext};

/// Outcome of one `receive` call, mostly useful for tests and scheduler
/// bookkeeping (did the agent do real work, or was it a no-op/yield?).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnResult {
    /// The turn ran to completion and produced at least one message.
    Ran,
    /// Paused or within the user-interjection window: message enqueued,
    /// no turn taken.
    Enqueued,
    /// Failed to acquire the channel lock before the timeout.
    LockTimeout,
}

/// Everything one agent's turn engine needs, shared across turns. Cheap to
/// clone (every field is an `Arc` or a plain config value).
#[derive(Clone)]
pub struct TurnEngine {
    pub room: Arc<ChatRoom>,
    pub lock: Arc<ChannelLock>,
    pub gate: Arc<TransportGate>,
    pub transport: Arc<ChatTransport>,
    pub tool_adapter: Arc<dyn ToolAdapter>,
    pub file_writer: Arc<dyn FileWriter>,
    pub detectors: Arc<DetectorRegistry>,
    pub pause: Arc<PauseController>,
    pub tools: Arc<Vec<ToolDefinition>>,
    pub config: Arc<RoundtableConfig>,
}

impl TurnEngine {
    /// Run one full turn for `agent_id`, if eligible. Called by the
    /// scheduler once it has picked this agent for the current tick.
    pub async fn receive(
        &self,
        agent_id: &str,
        system_prompt: &str,
        incoming_from: Option<&str>,
        now_ms: i64,
    ) -> TurnResult {
        let turn_cfg = &self.config.turn;

        // Step 1: paused or within the user-interjection window ⇒ enqueue only.
        if self.pause.is_paused()
            || self
                .pause
                .recently_interjected(now_ms, turn_cfg.user_interject_window_ms)
        {
            return TurnResult::Enqueued;
        }

        let Some(handle) = self.room.agent_handle(agent_id) else {
            warn!(agent_id, "turn engine: unknown agent id");
            return TurnResult::Enqueued;
        };

        // Step 2: acquire the channel lock for the duration of the turn.
        let guard = match self
            .lock
            .acquire(Duration::from_millis(self.config.sync.lock_max_ms), agent_id)
            .await
        {
            Ok(g) => g,
            Err(e) => {
                warn!(agent_id, error = %e, "turn engine: lock acquire timed out");
                return TurnResult::LockTimeout;
            }
        };

        // Step 3: re-check the pause gate.
        if self.pause.is_paused() {
            guard.release().await;
            return TurnResult::Enqueued;
        }

        let result = self.run_locked_turn(&handle, agent_id, system_prompt, incoming_from, now_ms).await;
        guard.release().await;
        result
    }

    async fn run_locked_turn(
        &self,
        handle: &AgentHandle,
        agent_id: &str,
        system_prompt: &str,
        incoming_from: Option<&str>,
        now_ms: i64,
    ) -> TurnResult {
        let turn_cfg = &self.config.turn;
        let max_msgs = turn_cfg.max_context_messages;

        // Step 4: conditional summarization.
        let (context_snapshot, turns_since_summary, model, soc_sample) = {
            let agent = handle.lock().await;
            (
                agent.context().to_vec(),
                agent.turns_since_summary,
                agent.model.clone(),
                agent.soc().to_string(),
            )
        };

        let summary = if context_snapshot.len() > crate::compact::high_watermark(max_msgs)
            && turns_since_summary >= 2
        {
            self.summarize(agent_id, &model, &context_snapshot).await
        } else {
            None
        };

        // Step 5: build the hop-1 message history.
        let user_focus_nudge = incoming_from
            .filter(|from| from.eq_ignore_ascii_case("user"))
            .map(|_| "The user just spoke directly; prioritize addressing them.".to_string());

        let (unread, tail) = {
            let mut agent = handle.lock().await;
            let unread = agent.drain_unread();
            let tail_len = unread_tail_len(agent.context().len(), max_msgs);
            let tail = agent.context()[agent.context().len() - tail_len..].to_vec();
            (unread, tail)
        };

        let history = build_history(
            agent_id,
            system_prompt,
            user_focus_nudge.as_deref(),
            summary.as_deref(),
            &tail,
            &unread,
        );

        let known_agents = self.room.agent_ids();
        let lease: Arc<dyn LeaseTouch> = self.lock.clone();

        let hop_ctx = HopLoopContext {
            agent_id,
            model: &model,
            room: &self.room,
            transport: &self.transport,
            gate: &self.gate,
            tool_adapter: self.tool_adapter.as_ref(),
            file_writer: self.file_writer.as_ref(),
            detectors: &self.detectors,
            pause: &self.pause,
            lease,
            known_agents: &known_agents,
            soc_sample: &soc_sample,
            tools: &self.tools,
            max_hops: turn_cfg.max_hops,
            max_tool_calls_per_turn: turn_cfg.max_tool_calls_per_turn,
            hop_timeout: Duration::from_millis(turn_cfg.hop_timeout_ms),
            idle_stream_ms: Duration::from_millis(self.config.transport.idle_stream_ms),
            hard_stop_ms: Duration::from_millis(self.config.transport.hard_stop_ms),
            user_interject_window_ms: turn_cfg.user_interject_window_ms,
            now_ms,
        };

        // Step 6: run the multi-hop loop.
        let outcome = run_hop_loop(&hop_ctx, history).await;

        // Step 7: append produced messages; nudge if no file written and
        // the triggering sender wasn't "user".
        let mut to_append = outcome.produced;
        let not_user = incoming_from
            .map(|f| !f.eq_ignore_ascii_case("user"))
            .unwrap_or(true);
        if !outcome.wrote_file && not_user {
            to_append.push(Message {
                seq: 0,
                ts_ms: now_ms,
                from: "system".to_string(),
                to: None,
                role: Role::System,
                content: "please write the required file or summarize".to_string(),
                tool_call_id: None,
                tool_name: None,
                reasoning: None,
                read: true,
            });
        }

        let last_assistant_text = to_append
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        {
            let mut agent = handle.lock().await;
            for m in &to_append {
                agent.push_context(m.clone());
            }
            agent.turn_count += 1;
            if summary.is_some() {
                agent.turns_since_summary = 0;
            } else {
                agent.turns_since_summary += 1;
            }
            agent.audience = outcome.final_audience.clone();
        }

        // Step 8: deliver through the audience.
        self.deliver(agent_id, &outcome.final_audience, &last_assistant_text, now_ms)
            .await;

        // Step 9: append to rolling SoC.
        {
            let mut agent = handle.lock().await;
            agent.push_soc(&last_assistant_text);
        }

        // Step 10: compact, then release (release happens in the caller).
        {
            let mut agent = handle.lock().await;
            if let Some(compacted) = compact_context(agent.context(), max_msgs) {
                agent.replace_context(compacted);
            }
        }

        info!(agent_id, "turn engine: turn complete");
        TurnResult::Ran
    }

    async fn summarize(&self, agent_id: &str, model: &str, context: &[Message]) -> Option<String> {
        let messages: Vec<ChatMessage> = context
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        let req = ChatRequest::new(model, messages);
        let guard = self.gate.acquire(format!("{agent_id}-summarize")).await;
        let result = self
            .transport
            .summarize_once(req, Duration::from_secs(30))
            .await;
        guard.release().await;
        match result {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(agent_id, error = %e, "turn engine: summarize call failed, proceeding without summary");
                None
            }
        }
    }

    async fn deliver(&self, from: &str, audience: &Audience, text: &str, now_ms: i64) {
        match audience {
            Audience::Group => self.room.broadcast(from, text, now_ms).await,
            Audience::Direct(to) => self.room.send_to(from, to, text, now_ms).await,
            Audience::File(_) => {
                // The file content was already written by the hop loop's tag
                // processing; nothing further to deliver through the room.
            }
        }
    }
}

fn unread_tail_len(context_len: usize, max_msgs: usize) -> usize {
    context_len.min(max_msgs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unread_tail_len_caps_at_max() {
        assert_eq!(unread_tail_len(5, 20), 5);
        assert_eq!(unread_tail_len(50, 20), 20);
    }
}
