//! Deterministic, non-LLM context compaction: threshold check, batch the
//! oldest N, replace with a summary. The summary itself is a plain
//! formatted string, not an LLM fact-extraction call — persistent
//! long-term memory is out of scope here.

use roundtable_core::{Message, Role};

/// `HIGH = max(maxMsgs+6, ceil(1.5*maxMsgs))`.
pub fn high_watermark(max_msgs: usize) -> usize {
    let scaled = ((max_msgs as f64) * 1.5).ceil() as usize;
    (max_msgs + 6).max(scaled)
}

/// `LOW = max(floor(0.6*maxMsgs), 6)`.
pub fn low_watermark(max_msgs: usize) -> usize {
    let scaled = ((max_msgs as f64) * 0.6).floor() as usize;
    scaled.max(6)
}

pub fn needs_compaction(context_len: usize, max_msgs: usize) -> bool {
    context_len > high_watermark(max_msgs)
}

const RECENT_HEAD_LINES: usize = 4;
const RECENT_HEAD_LINE_CHARS: usize = 140;

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

fn deterministic_summary(head: &[Message]) -> String {
    let mut tools_used: Vec<String> = Vec::new();
    let mut last_cmd: Option<String> = None;
    let mut files_written: Vec<String> = Vec::new();

    for m in head {
        if m.role == Role::Tool {
            if let Some(name) = &m.tool_name {
                if name == "write_file" {
                    if let Some(path) = m.content.strip_prefix("wrote ") {
                        if !files_written.iter().any(|p| p == path) {
                            files_written.push(path.to_string());
                        }
                    }
                } else {
                    if !tools_used.iter().any(|t| t == name) {
                        tools_used.push(name.clone());
                    }
                    last_cmd = Some(m.content.clone());
                }
            }
        }
    }

    let recent_head: Vec<String> = head
        .iter()
        .rev()
        .filter(|m| m.role != Role::System)
        .take(RECENT_HEAD_LINES)
        .map(|m| truncate_chars(&m.content, RECENT_HEAD_LINE_CHARS))
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    format!(
        "[summary] Compressed {n} earlier turns.\ntools_used={tools}\nlast_cmd={cmd}\nfiles_written={files}\nrecent_head:\n{recent}",
        n = head.len(),
        tools = tools_used.join(","),
        cmd = last_cmd.unwrap_or_default(),
        files = files_written.join(","),
        recent = recent_head.join("\n"),
    )
}

/// Apply hysteresis compaction to `context` if it's above `HIGH`. Returns
/// `None` when no-op. On compaction, the returned vector is `[summary,
/// ...tail]`, further trimmed to `LOW+1` if it's still over that length.
pub fn compact_context(context: &[Message], max_msgs: usize) -> Option<Vec<Message>> {
    if !needs_compaction(context.len(), max_msgs) {
        return None;
    }
    let low = low_watermark(max_msgs);
    let tail_len = low.saturating_sub(1).min(context.len());
    let head_len = context.len() - tail_len;
    let head = &context[..head_len];
    let tail = &context[head_len..];

    let summary_message = Message {
        seq: tail.first().map(|m| m.seq).unwrap_or_default(),
        ts_ms: tail.first().map(|m| m.ts_ms).unwrap_or_default(),
        from: "system".to_string(),
        to: None,
        role: Role::System,
        content: deterministic_summary(head),
        tool_call_id: None,
        tool_name: None,
        reasoning: None,
        read: true,
    };

    let mut compacted = Vec::with_capacity(1 + tail.len());
    compacted.push(summary_message);
    compacted.extend_from_slice(tail);

    if compacted.len() > low + 1 {
        let excess = compacted.len() - (low + 1);
        compacted.drain(1..1 + excess);
    }

    Some(compacted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str) -> Message {
        Message {
            seq: 0,
            ts_ms: 0,
            from: "alice".to_string(),
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
    fn watermarks_match_formula() {
        assert_eq!(high_watermark(20), 30);
        assert_eq!(low_watermark(20), 12);
        assert_eq!(low_watermark(5), 6);
    }

    #[test]
    fn below_high_is_noop() {
        let context: Vec<Message> = (0..10).map(|_| msg(Role::Assistant, "x")).collect();
        assert!(compact_context(&context, 20).is_none());
    }

    #[test]
    fn above_high_compacts_to_low_plus_one() {
        let context: Vec<Message> = (0..40).map(|i| msg(Role::Assistant, &format!("m{i}"))).collect();
        let compacted = compact_context(&context, 20).unwrap();
        assert!(compacted.len() <= low_watermark(20) + 1);
        assert_eq!(compacted[0].role, Role::System);
        assert!(compacted[0].content.starts_with("[summary]"));
    }

    #[test]
    fn summary_mentions_compressed_count() {
        let context: Vec<Message> = (0..40).map(|i| msg(Role::Assistant, &format!("m{i}"))).collect();
        let compacted = compact_context(&context, 20).unwrap();
        assert!(compacted[0].content.contains("Compressed"));
    }
}
