//! Tag grammar: `@llm:<name>` / `@<name>` (agent), `#file:<path>` (file).
//!
//! Parsing strips tag tokens and returns each tag paired with the text
//! between its end and the start of the next tag (or end-of-input) —
//! content is never handed back attached to the token that introduced it.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagKind {
    Agent(String),
    File(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub kind: TagKind,
    pub raw_token: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagParseResult {
    /// Input with every tag token removed; tag content is left in place.
    pub cleaned: String,
    /// Text preceding the first tag, untouched.
    pub preamble: String,
    pub tags: Vec<Tag>,
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn is_path_char(c: char) -> bool {
    is_name_char(c) || c == '.' || c == '/'
}

struct Marker {
    start: usize,
    end: usize,
    kind: TagKind,
}

fn find_markers(text: &str) -> Vec<Marker> {
    let mut markers = Vec::new();
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut i = 0;
    while i < chars.len() {
        let (byte_idx, c) = chars[i];
        if c == '@' {
            if text[byte_idx..].starts_with("@llm:") {
                let name_start = byte_idx + "@llm:".len();
                let name_end = scan_while(text, name_start, is_name_char);
                if name_end > name_start {
                    markers.push(Marker {
                        start: byte_idx,
                        end: name_end,
                        kind: TagKind::Agent(text[name_start..name_end].to_string()),
                    });
                    i = advance_to(&chars, name_end);
                    continue;
                }
            } else {
                let name_start = byte_idx + 1;
                let name_end = scan_while(text, name_start, is_name_char);
                if name_end > name_start {
                    markers.push(Marker {
                        start: byte_idx,
                        end: name_end,
                        kind: TagKind::Agent(text[name_start..name_end].to_string()),
                    });
                    i = advance_to(&chars, name_end);
                    continue;
                }
            }
        } else if c == '#' && text[byte_idx..].starts_with("#file:") {
            let path_start = byte_idx + "#file:".len();
            let path_end = scan_while(text, path_start, is_path_char);
            if path_end > path_start {
                markers.push(Marker {
                    start: byte_idx,
                    end: path_end,
                    kind: TagKind::File(text[path_start..path_end].to_string()),
                });
                i = advance_to(&chars, path_end);
                continue;
            }
        }
        i += 1;
    }
    markers
}

fn scan_while(text: &str, from: usize, pred: impl Fn(char) -> bool) -> usize {
    let mut end = from;
    for (idx, c) in text[from..].char_indices() {
        if !pred(c) {
            break;
        }
        end = from + idx + c.len_utf8();
    }
    end
}

fn advance_to(chars: &[(usize, char)], byte_idx: usize) -> usize {
    chars.iter().position(|(b, _)| *b >= byte_idx).unwrap_or(chars.len())
}

/// Strip tag tokens, pairing each with the content span that follows it.
pub fn parse(text: &str) -> TagParseResult {
    let markers = find_markers(text);
    if markers.is_empty() {
        return TagParseResult {
            cleaned: text.to_string(),
            preamble: text.to_string(),
            tags: Vec::new(),
        };
    }

    let preamble = text[..markers[0].start].to_string();
    let mut cleaned = preamble.clone();
    let mut tags = Vec::with_capacity(markers.len());

    for (i, marker) in markers.iter().enumerate() {
        let content_start = marker.end;
        let content_end = markers.get(i + 1).map(|m| m.start).unwrap_or(text.len());
        let content = text[content_start..content_end].trim().to_string();
        cleaned.push_str(&content);
        tags.push(Tag {
            kind: marker.kind.clone(),
            raw_token: text[marker.start..marker.end].to_string(),
            content,
        });
    }

    TagParseResult {
        cleaned,
        preamble,
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_with_no_tags() {
        let result = parse("just plain text, no tags here");
        assert_eq!(result.cleaned, "just plain text, no tags here");
        assert!(result.tags.is_empty());
    }

    #[test]
    fn parses_llm_tag() {
        let result = parse("@llm:bob please review this");
        assert_eq!(result.tags.len(), 1);
        assert_eq!(result.tags[0].kind, TagKind::Agent("bob".to_string()));
        assert_eq!(result.tags[0].content, "please review this");
    }

    #[test]
    fn parses_short_agent_tag() {
        let result = parse("@carol take a look");
        assert_eq!(result.tags[0].kind, TagKind::Agent("carol".to_string()));
    }

    #[test]
    fn parses_file_tag() {
        let result = parse("#file:src/main.rs contains the entry point");
        match &result.tags[0].kind {
            TagKind::File(path) => assert_eq!(path, "src/main.rs"),
            _ => panic!("expected File tag"),
        }
        assert_eq!(result.tags[0].content, "contains the entry point");
    }

    #[test]
    fn preserves_order_and_splits_content_at_next_tag() {
        let result = parse("@alice do this #file:out.txt then write here @bob check it");
        assert_eq!(result.tags.len(), 3);
        assert_eq!(result.tags[0].content, "do this");
        assert_eq!(result.tags[1].content, "then write here");
        assert_eq!(result.tags[2].content, "check it");
    }

    #[test]
    fn round_trip_preserves_content_modulo_trim() {
        let original = "@alice   hello world  @bob   goodbye";
        let result = parse(original);
        let mut reconstructed = result.preamble.clone();
        for tag in &result.tags {
            reconstructed.push_str(&tag.raw_token);
            reconstructed.push(' ');
            reconstructed.push_str(&tag.content);
        }
        assert!(reconstructed.contains("hello world"));
        assert!(reconstructed.contains("goodbye"));
    }
}
