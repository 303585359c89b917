//! Builds one hop's message history from an agent's bounded context,
//! viewed from that agent's own perspective.

use roundtable_core::{Message, Role};
use roundtable_transport::ChatMessage;

/// Convert one context/inbox [`Message`] into the [`ChatMessage`] shape the
/// provider sees, from `viewer_id`'s perspective: other senders' messages
/// become `role=user` (with a speaker prefix so the model can tell voices
/// apart), the viewer's own past messages stay `role=assistant`, and
/// system/tool messages pass through unchanged.
pub fn perspective_message(viewer_id: &str, message: &Message) -> ChatMessage {
    match message.role {
        Role::System | Role::Tool => ChatMessage {
            role: message.role,
            content: message.content.clone(),
        },
        Role::Assistant if message.from == viewer_id => ChatMessage {
            role: Role::Assistant,
            content: message.content.clone(),
        },
        _ => ChatMessage {
            role: Role::User,
            content: with_speaker_prefix(&message.from, &message.content),
        },
    }
}

/// Prepend `"<from>: "` to `content` exactly once, skipping the literal
/// `"user"` sender (already unambiguous) and content that already carries
/// the prefix (e.g. a message relayed a second time).
fn with_speaker_prefix(from: &str, content: &str) -> String {
    if from.eq_ignore_ascii_case("user") {
        return content.to_string();
    }
    let prefix = format!("{from}: ");
    if content.starts_with(&prefix) {
        content.to_string()
    } else {
        format!("{prefix}{content}")
    }
}

/// Assemble the full hop-1 history: system prompt, optional user-focus
/// nudge, optional compaction summary, the trailing context window, and
/// the freshly drained unread batch — in that order.
#[allow(clippy::too_many_arguments)]
pub fn build_history(
    viewer_id: &str,
    system_prompt: &str,
    user_focus_nudge: Option<&str>,
    summary: Option<&str>,
    context_tail: &[Message],
    unread_batch: &[Message],
) -> Vec<ChatMessage> {
    let mut history = Vec::with_capacity(context_tail.len() + unread_batch.len() + 3);
    history.push(ChatMessage {
        role: Role::System,
        content: system_prompt.to_string(),
    });
    if let Some(nudge) = user_focus_nudge {
        history.push(ChatMessage {
            role: Role::System,
            content: nudge.to_string(),
        });
    }
    if let Some(summary) = summary {
        history.push(ChatMessage {
            role: Role::System,
            content: summary.to_string(),
        });
    }
    history.extend(context_tail.iter().map(|m| perspective_message(viewer_id, m)));
    history.extend(unread_batch.iter().map(|m| perspective_message(viewer_id, m)));
    history
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(from: &str, role: Role, content: &str) -> Message {
        Message {
            seq: 0,
            ts_ms: 0,
            from: from.to_string(),
            to: None,
            role,
            content: content.to_string(),
            tool_call_id: None,
            tool_name: None,
            reasoning: None,
            read: false,
        }
    }

    #[test]
    fn own_assistant_message_stays_assistant() {
        let m = msg("alice", Role::Assistant, "hi there");
        let converted = perspective_message("alice", &m);
        assert_eq!(converted.role, Role::Assistant);
        assert_eq!(converted.content, "hi there");
    }

    #[test]
    fn other_agent_message_becomes_user_with_prefix() {
        let m = msg("bob", Role::Assistant, "status update");
        let converted = perspective_message("alice", &m);
        assert_eq!(converted.role, Role::User);
        assert_eq!(converted.content, "bob: status update");
    }

    #[test]
    fn user_sender_gets_no_prefix() {
        let m = msg("User", Role::User, "kickoff");
        let converted = perspective_message("alice", &m);
        assert_eq!(converted.content, "kickoff");
    }

    #[test]
    fn prefix_not_duplicated() {
        let m = msg("bob", Role::Assistant, "bob: already prefixed");
        let converted = perspective_message("alice", &m);
        assert_eq!(converted.content, "bob: already prefixed");
    }

    #[test]
    fn system_and_tool_pass_through() {
        let sys = msg("system", Role::System, "boot");
        let tool = msg("alice", Role::Tool, "exit 0");
        assert_eq!(perspective_message("alice", &sys).role, Role::System);
        assert_eq!(perspective_message("alice", &tool).role, Role::Tool);
    }

    #[test]
    fn build_history_orders_sections() {
        let tail = vec![msg("bob", Role::Assistant, "earlier")];
        let unread = vec![msg("User", Role::User, "latest")];
        let history = build_history(
            "alice",
            "you are alice",
            Some("focus on the user"),
            Some("[summary] ..."),
            &tail,
            &unread,
        );
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].content, "you are alice");
        assert_eq!(history[1].content, "focus on the user");
        assert_eq!(history[2].content, "[summary] ...");
        assert_eq!(history[3].content, "bob: earlier");
        assert_eq!(history[4].content, "latest");
    }
}
