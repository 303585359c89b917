use std::collections::VecDeque;

use crate::message::Message;

/// Destination for a message an agent is about to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Group,
    Direct(String),
    File(String),
}

/// Per-agent state: identity, bounded context, unread inbox, rolling
/// stream-of-consciousness sample, current audience, and turn counter.
///
/// Owned exclusively by the agent itself — only
/// [`ChatRoom::deliver`](crate::room::ChatRoom) appends to `inbox`, via the
/// agent's receive hook; nothing else mutates these fields directly.
pub struct Agent {
    pub id: String,
    pub model: String,
    context: Vec<Message>,
    inbox: VecDeque<Message>,
    /// Rolling sample of this agent's own recent assistant output, capped at
    /// `soc_cap_chars`. Used by cross-turn repetition detection.
    soc: String,
    soc_cap_chars: usize,
    pub audience: Audience,
    pub turn_count: u64,
    /// Turns elapsed since the context was last summarized (compacted).
    pub turns_since_summary: u64,
}

impl Agent {
    pub fn new(id: impl Into<String>, model: impl Into<String>, soc_cap_chars: usize) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            context: Vec::new(),
            inbox: VecDeque::new(),
            soc: String::new(),
            soc_cap_chars,
            audience: Audience::Group,
            turn_count: 0,
            turns_since_summary: 0,
        }
    }

    pub fn context(&self) -> &[Message] {
        &self.context
    }

    pub fn push_context(&mut self, message: Message) {
        self.context.push(message);
    }

    pub fn replace_context(&mut self, messages: Vec<Message>) {
        self.context = messages;
    }

    /// Append an unread message. Called only through the room's delivery
    /// path (`ChatRoom::broadcast`/`send_to`), never directly by callers.
    pub fn receive(&mut self, message: Message) {
        self.inbox.push_back(message);
    }

    pub fn has_unread(&self) -> bool {
        !self.inbox.is_empty()
    }

    pub fn unread_len(&self) -> usize {
        self.inbox.len()
    }

    /// Sender of the oldest unread message, if any — used by the scheduler
    /// to decide whether the turn it's about to run was triggered by a
    /// specific message or is a proactive tick.
    pub fn peek_unread_from(&self) -> Option<String> {
        self.inbox.front().map(|m| m.from.clone())
    }

    /// Drain the entire unread inbox in arrival order.
    pub fn drain_unread(&mut self) -> Vec<Message> {
        self.inbox.drain(..).collect()
    }

    /// Append text to the rolling stream-of-consciousness sample, truncating
    /// from the front so the buffer never exceeds `soc_cap_chars`.
    pub fn push_soc(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.soc.push('\n');
        self.soc.push_str(text);
        if self.soc.len() > self.soc_cap_chars {
            let excess = self.soc.len() - self.soc_cap_chars;
            // Cut on a char boundary at or after `excess`.
            let mut cut = excess;
            while cut < self.soc.len() && !self.soc.is_char_boundary(cut) {
                cut += 1;
            }
            self.soc.drain(..cut);
        }
    }

    pub fn soc(&self) -> &str {
        &self.soc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(content: &str) -> Message {
        Message {
            seq: 0,
            ts_ms: 0,
            from: "other".into(),
            to: None,
            role: crate::message::Role::User,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
            reasoning: None,
            read: false,
        }
    }

    #[test]
    fn soc_never_exceeds_cap() {
        let mut agent = Agent::new("alice", "model-x", 32);
        for _ in 0..20 {
            agent.push_soc("0123456789");
        }
        assert!(agent.soc().len() <= 32);
    }

    #[test]
    fn drain_unread_empties_inbox_in_order() {
        let mut agent = Agent::new("alice", "model-x", 1024);
        agent.receive(msg("first"));
        agent.receive(msg("second"));
        assert_eq!(agent.unread_len(), 2);
        let drained = agent.drain_unread();
        assert_eq!(drained[0].content, "first");
        assert_eq!(drained[1].content, "second");
        assert!(!agent.has_unread());
    }
}
