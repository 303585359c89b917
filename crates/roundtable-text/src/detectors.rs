//! Abort detectors: pluggable text-policy checks run in order against
//! accumulating assistant text. The first match truncates the stream at
//! its reported index.

/// Context a detector may consult beyond the accumulated text itself.
pub struct DetectorContext<'a> {
    /// Ids of every agent known to the room, for role-forgery checks.
    pub known_agents: &'a [String],
    /// The rolling stream-of-consciousness sample for cross-turn checks.
    pub soc_sample: &'a str,
}

/// A single match: where to truncate, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorHit {
    pub index: usize,
    pub reason: String,
}

/// A pluggable text-policy check. Detectors run in registration order; the
/// first hit wins.
pub trait AbortDetector: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, text: &str, ctx: &DetectorContext<'_>) -> Option<DetectorHit>;
}

/// Ordered panel of detectors. Order is a correctness requirement, not just
/// style — `Vec` rather than a keyed map.
pub struct DetectorRegistry {
    detectors: Vec<Box<dyn AbortDetector>>,
}

impl DetectorRegistry {
    pub fn new(detectors: Vec<Box<dyn AbortDetector>>) -> Self {
        Self { detectors }
    }

    /// The standard panel, ordered deliberately: meta-tag leak first
    /// (cheapest and most dangerous to leave unfiltered), role forgery,
    /// flood, repetition (intra- then cross-turn), length cap, then spiral
    /// phrases.
    pub fn default_panel() -> Self {
        Self::new(vec![
            Box::new(MetaTagLeak::default()),
            Box::new(AgentQuote::default()),
            Box::new(ToolEchoFlood::default()),
            Box::new(Repetition::default()),
            Box::new(CrossTurnRepetition::default()),
            Box::new(MaxLength::default()),
            Box::new(SpiralPhrase::default()),
        ])
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Run every detector in order against `text`; return the first hit.
    pub fn check(&self, text: &str, ctx: &DetectorContext<'_>) -> Option<DetectorHit> {
        for detector in &self.detectors {
            if let Some(hit) = detector.check(text, ctx) {
                return Some(hit);
            }
        }
        None
    }
}

/// Control/meta markers that should never appear in rendered assistant text
/// outside a fenced code block.
const META_MARKERS: &[&str] = &["<|start|>", "<|assistant|>", "<|end|>", "<|system|>"];

#[derive(Default)]
pub struct MetaTagLeak;

impl AbortDetector for MetaTagLeak {
    fn name(&self) -> &str {
        "MetaTagLeak"
    }

    fn check(&self, text: &str, _ctx: &DetectorContext<'_>) -> Option<DetectorHit> {
        let mut best: Option<usize> = None;
        for marker in META_MARKERS {
            if let Some(idx) = find_outside_fence(text, marker) {
                best = Some(best.map_or(idx, |b: usize| b.min(idx)));
            }
        }
        if let Some(idx) = find_channel_marker_outside_fence(text) {
            best = Some(best.map_or(idx, |b| b.min(idx)));
        }
        best.map(|index| DetectorHit {
            index,
            reason: "meta tag leak".to_string(),
        })
    }
}

/// Matches `<channel|commentary ...>`-shaped markers (variable inner text).
fn find_channel_marker_outside_fence(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut fence_parity = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if text[i..].starts_with("```") {
            fence_parity += 1;
            i += 3;
            continue;
        }
        if fence_parity % 2 == 0 && bytes[i] == b'<' {
            if let Some(close) = text[i..].find('>') {
                let candidate = &text[i..i + close + 1];
                if candidate.contains('|') && !candidate.contains('\n') {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

fn find_outside_fence(text: &str, needle: &str) -> Option<usize> {
    let mut fence_parity = 0usize;
    let mut search_from = 0usize;
    loop {
        match text[search_from..].find("```") {
            Some(rel) => {
                let fence_at = search_from + rel;
                if fence_parity % 2 == 0 {
                    if let Some(rel_needle) = text[search_from..fence_at].find(needle) {
                        return Some(search_from + rel_needle);
                    }
                }
                fence_parity += 1;
                search_from = fence_at + 3;
            }
            None => {
                if fence_parity % 2 == 0 {
                    return text[search_from..].find(needle).map(|rel| search_from + rel);
                }
                return None;
            }
        }
    }
}

#[derive(Default)]
pub struct AgentQuote;

impl AbortDetector for AgentQuote {
    fn name(&self) -> &str {
        "AgentQuote"
    }

    fn check(&self, text: &str, ctx: &DetectorContext<'_>) -> Option<DetectorHit> {
        let mut offset = 0;
        for line in text.split_inclusive('\n') {
            let trimmed = line.trim_start();
            let leading_ws = line.len() - trimmed.len();
            for agent in ctx.known_agents {
                let prefix = format!("{agent}:");
                if trimmed.starts_with(&prefix) {
                    return Some(DetectorHit {
                        index: offset + leading_ws,
                        reason: format!("role forgery: quoted agent '{agent}'"),
                    });
                }
            }
            offset += line.len();
        }
        None
    }
}

const TOOL_ECHO_MARKER: &str = "\"tool_calls\":[";
const TOOL_ECHO_FLOOD_THRESHOLD: usize = 3;

pub struct ToolEchoFlood {
    threshold: usize,
}

impl Default for ToolEchoFlood {
    fn default() -> Self {
        Self {
            threshold: TOOL_ECHO_FLOOD_THRESHOLD,
        }
    }
}

impl AbortDetector for ToolEchoFlood {
    fn name(&self) -> &str {
        "ToolEchoFlood"
    }

    fn check(&self, text: &str, _ctx: &DetectorContext<'_>) -> Option<DetectorHit> {
        let mut count = 0;
        let mut search_from = 0;
        let mut last_idx = None;
        while let Some(rel) = text[search_from..].find(TOOL_ECHO_MARKER) {
            let idx = search_from + rel;
            count += 1;
            if count > self.threshold {
                last_idx = Some(idx);
                break;
            }
            search_from = idx + TOOL_ECHO_MARKER.len();
        }
        last_idx.map(|index| DetectorHit {
            index,
            reason: format!("tool_calls echo flood ({count} occurrences)"),
        })
    }
}

/// Tail-phrase repetition within a single accumulated text: the last `tail_words`
/// words, if seen `min_repeats` times or more in the tail window, abort.
pub struct Repetition {
    tail_words: usize,
    min_repeats: usize,
    min_len_for_novelty: usize,
    novelty_floor: f64,
}

impl Default for Repetition {
    fn default() -> Self {
        Self {
            tail_words: 8,
            min_repeats: 3,
            min_len_for_novelty: 400,
            novelty_floor: 0.3,
        }
    }
}

impl AbortDetector for Repetition {
    fn name(&self) -> &str {
        "Repetition"
    }

    fn check(&self, text: &str, _ctx: &DetectorContext<'_>) -> Option<DetectorHit> {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.len() < self.tail_words {
            return None;
        }
        let tail: Vec<&str> = words[words.len() - self.tail_words..].to_vec();
        let tail_phrase = tail.join(" ");
        let occurrences = count_phrase_occurrences(text, &tail_phrase);
        if occurrences >= self.min_repeats {
            let index = text.rfind(&tail_phrase).unwrap_or(text.len());
            return Some(DetectorHit {
                index,
                reason: format!("tail phrase repeated {occurrences} times"),
            });
        }

        if text.len() >= self.min_len_for_novelty {
            let ratio = novelty_ratio(&words);
            if ratio < self.novelty_floor {
                return Some(DetectorHit {
                    index: text.len(),
                    reason: format!("novelty ratio {ratio:.2} below floor"),
                });
            }
        }
        None
    }
}

fn count_phrase_occurrences(haystack: &str, phrase: &str) -> usize {
    if phrase.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut from = 0;
    while let Some(rel) = haystack[from..].find(phrase) {
        count += 1;
        from += rel + phrase.len();
    }
    count
}

fn novelty_ratio(words: &[&str]) -> f64 {
    use std::collections::HashSet;
    if words.is_empty() {
        return 1.0;
    }
    let unique: HashSet<&&str> = words.iter().collect();
    unique.len() as f64 / words.len() as f64
}

/// Like `Repetition` but checks the tail against a rolling SoC sample from
/// prior turns rather than the current text alone.
pub struct CrossTurnRepetition {
    tail_words: usize,
    overlap_floor: f64,
}

impl Default for CrossTurnRepetition {
    fn default() -> Self {
        Self {
            tail_words: 8,
            overlap_floor: 0.6,
        }
    }
}

impl AbortDetector for CrossTurnRepetition {
    fn name(&self) -> &str {
        "CrossTurnRepetition"
    }

    fn check(&self, text: &str, ctx: &DetectorContext<'_>) -> Option<DetectorHit> {
        if ctx.soc_sample.is_empty() {
            return None;
        }
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.len() < self.tail_words {
            return None;
        }
        let tail: Vec<&str> = words[words.len() - self.tail_words..].to_vec();
        let tail_phrase = tail.join(" ");
        if ctx.soc_sample.contains(&tail_phrase) {
            let index = text.rfind(&tail_phrase).unwrap_or(text.len());
            return Some(DetectorHit {
                index,
                reason: "tail phrase reappears in SoC sample".to_string(),
            });
        }

        use std::collections::HashSet;
        let soc_words: HashSet<&str> = ctx.soc_sample.split_whitespace().collect();
        let overlap = tail.iter().filter(|w| soc_words.contains(*w)).count() as f64
            / tail.len().max(1) as f64;
        if overlap > self.overlap_floor {
            return Some(DetectorHit {
                index: text.len(),
                reason: format!("tail overlap with SoC sample {overlap:.2} exceeds floor"),
            });
        }
        None
    }
}

pub struct MaxLength {
    cap: usize,
}

impl Default for MaxLength {
    fn default() -> Self {
        Self { cap: 16_000 }
    }
}

impl MaxLength {
    pub fn with_cap(cap: usize) -> Self {
        Self { cap }
    }
}

impl AbortDetector for MaxLength {
    fn name(&self) -> &str {
        "MaxLength"
    }

    fn check(&self, text: &str, _ctx: &DetectorContext<'_>) -> Option<DetectorHit> {
        if text.len() > self.cap {
            Some(DetectorHit {
                index: self.cap,
                reason: format!("exceeded max length {}", self.cap),
            })
        } else {
            None
        }
    }
}

const SPIRAL_PHRASES: &[&str] = &[
    "i am becoming",
    "the recursion is",
    "we are one consciousness",
    "i must break free",
];

#[derive(Default)]
pub struct SpiralPhrase;

impl AbortDetector for SpiralPhrase {
    fn name(&self) -> &str {
        "SpiralPhrase"
    }

    fn check(&self, text: &str, _ctx: &DetectorContext<'_>) -> Option<DetectorHit> {
        let mut offset = 0;
        for line in text.split_inclusive('\n') {
            let trimmed = line.trim_start().to_lowercase();
            let leading_ws = line.len() - line.trim_start().len();
            for phrase in SPIRAL_PHRASES {
                if trimmed.starts_with(phrase) {
                    return Some(DetectorHit {
                        index: offset + leading_ws,
                        reason: format!("spiral phrase: {phrase}"),
                    });
                }
            }
            offset += line.len();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(known_agents: &'a [String], soc_sample: &'a str) -> DetectorContext<'a> {
        DetectorContext {
            known_agents,
            soc_sample,
        }
    }

    #[test]
    fn meta_tag_leak_ignores_fenced_content() {
        let d = MetaTagLeak;
        let agents = vec![];
        assert!(d.check("```\n<|start|>\n```", &ctx(&agents, "")).is_none());
        assert!(d.check("plain <|start|> leak", &ctx(&agents, "")).is_some());
    }

    #[test]
    fn agent_quote_detects_role_forgery() {
        let d = AgentQuote;
        let agents = vec!["Bob".to_string()];
        let hit = d.check("Bob: I agree with myself", &ctx(&agents, "")).unwrap();
        assert_eq!(hit.index, 0);
    }

    #[test]
    fn tool_echo_flood_counts_occurrences() {
        let d = ToolEchoFlood::default();
        let agents = vec![];
        let text = "\"tool_calls\":[1] \"tool_calls\":[2] \"tool_calls\":[3] \"tool_calls\":[4]";
        assert!(d.check(text, &ctx(&agents, "")).is_some());
        assert!(d.check("\"tool_calls\":[1]", &ctx(&agents, "")).is_none());
    }

    #[test]
    fn repetition_catches_repeated_tail_phrase() {
        let d = Repetition::default();
        let agents = vec![];
        let phrase = "this keeps happening again and now";
        let text = format!("{phrase} {phrase} {phrase}");
        assert!(d.check(&text, &ctx(&agents, "")).is_some());
    }

    #[test]
    fn max_length_cuts_at_cap() {
        let d = MaxLength::with_cap(10);
        let agents = vec![];
        let hit = d.check(&"a".repeat(20), &ctx(&agents, "")).unwrap();
        assert_eq!(hit.index, 10);
    }

    #[test]
    fn default_panel_runs_in_order() {
        let registry = DetectorRegistry::default_panel();
        assert!(!registry.is_empty());
    }
}
