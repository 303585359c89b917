//! Per-chunk meta-token sanitizer.
//!
//! Replaces control/meta markers with a single placeholder, tracking
//! code-fence parity *across* chunks so a fence opened in one chunk and
//! closed in a later one still whitelists the span between them.

const PLACEHOLDER: &str = "[meta]";

const MARKERS: &[&str] = &[
    "<|start|>",
    "<|assistant|>",
    "<|end|>",
    "<|system|>",
    "<|user|>",
];

/// Tracks code-fence parity across a sequence of chunks belonging to one
/// stream. Odd parity (an unmatched ``` ``` ``` opened earlier) means the
/// sanitizer is currently inside a fence and must pass content through
/// unchanged.
#[derive(Default)]
pub struct Sanitizer {
    fence_parity: usize,
}

impl Sanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inside_fence(&self) -> bool {
        self.fence_parity % 2 == 1
    }

    /// Sanitize one chunk, updating fence parity for the next call.
    pub fn sanitize_chunk(&mut self, chunk: &str) -> String {
        let mut out = String::with_capacity(chunk.len());
        let mut rest = chunk;

        loop {
            match rest.find("```") {
                None => {
                    out.push_str(&self.process_segment(rest));
                    break;
                }
                Some(idx) => {
                    let (segment, remainder) = rest.split_at(idx);
                    out.push_str(&self.process_segment(segment));
                    out.push_str("```");
                    self.fence_parity += 1;
                    rest = &remainder[3..];
                }
            }
        }
        out
    }

    fn process_segment(&self, segment: &str) -> String {
        if self.inside_fence() {
            return segment.to_string();
        }
        let mut text = segment.to_string();
        for marker in MARKERS {
            if text.contains(marker) {
                text = text.replace(marker, PLACEHOLDER);
            }
        }
        replace_channel_markers(&text)
    }
}

fn replace_channel_markers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find('<') {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                let (before, after) = rest.split_at(start);
                match after.find('>') {
                    Some(end) if !after[..end].contains('\n') && after[1..end].contains('|') => {
                        out.push_str(before);
                        out.push_str(PLACEHOLDER);
                        rest = &after[end + 1..];
                    }
                    _ => {
                        out.push_str(before);
                        out.push('<');
                        rest = &after[1..];
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_meta_markers_outside_fence() {
        let mut s = Sanitizer::new();
        let out = s.sanitize_chunk("hello <|start|> world");
        assert_eq!(out, "hello [meta] world");
    }

    #[test]
    fn identity_inside_fence() {
        let mut s = Sanitizer::new();
        let out = s.sanitize_chunk("```\n<|start|>\n```");
        assert_eq!(out, "```\n<|start|>\n```");
    }

    #[test]
    fn fence_state_carries_across_chunks() {
        let mut s = Sanitizer::new();
        let first = s.sanitize_chunk("```\nsome code <|start|>");
        assert!(first.contains("<|start|>"));
        assert!(s.inside_fence());
        let second = s.sanitize_chunk("more code\n``` <|start|> leaked");
        assert!(second.contains("more code"));
        assert!(second.contains("[meta]"));
    }

    #[test]
    fn channel_marker_replaced() {
        let mut s = Sanitizer::new();
        let out = s.sanitize_chunk("prefix <channel|commentary to=x> suffix");
        assert_eq!(out, "prefix [meta] suffix");
    }
}
