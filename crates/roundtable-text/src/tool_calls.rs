//! Scans assistant text for embedded `"tool_calls":[ ... ]` arrays, the
//! shape some OpenAI-compatible backends echo back inline in content rather
//! than as a structured field.

use serde_json::Value;

const MARKER: &str = "\"tool_calls\":[";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedToolCall {
    pub name: String,
    /// Always normalized to a JSON-encoded string, whether the source had
    /// `arguments` as a string or an object.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallExtraction {
    pub cleaned: String,
    pub calls: Vec<ExtractedToolCall>,
}

/// Find the end of the `[...]` array starting right after `open_bracket_idx`
/// (the byte index of the `[` itself), respecting string escapes.
fn find_matching_bracket(text: &str, open_bracket_idx: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 1i32;
    let mut in_string = false;
    let mut i = open_bracket_idx + 1;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            match b {
                b'\\' => {
                    i += 1; // skip escaped char
                }
                b'"' => in_string = false,
                _ => {}
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'[' => depth += 1,
                b']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn normalize_arguments(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => serde_json::to_string(value).ok(),
        _ => None,
    }
}

fn parse_entries(array: &Value) -> Vec<ExtractedToolCall> {
    let mut calls = Vec::new();
    let Value::Array(items) = array else {
        return calls;
    };
    for item in items {
        let is_function = item.get("type").and_then(Value::as_str) == Some("function");
        let Some(function) = item.get("function") else {
            continue;
        };
        let Some(name) = function.get("name").and_then(Value::as_str) else {
            continue;
        };
        if !is_function {
            continue;
        }
        let arguments = function
            .get("arguments")
            .and_then(normalize_arguments)
            .unwrap_or_else(|| "{}".to_string());
        calls.push(ExtractedToolCall {
            name: name.to_string(),
            arguments,
        });
    }
    calls
}

/// Expand `[removal_start, removal_end)` to also consume an immediately
/// surrounding `{ ... }` wrapper, if the segment is the object's sole key.
fn expand_to_enclosing_braces(text: &str, start: usize, end: usize) -> (usize, usize) {
    let before = text[..start].trim_end();
    let after = text[end..].trim_start();
    if before.ends_with('{') && after.starts_with('}') {
        let brace_start = before.len() - 1;
        let brace_end = end + (text[end..].len() - after.len()) + 1;
        (brace_start, brace_end)
    } else {
        (start, end)
    }
}

/// Extract every `"tool_calls":[...]` occurrence, JSON-parsing each array
/// and stripping the matched segment (plus an enclosing bare `{}`, if
/// present) from the cleaned output. Segments that fail to parse are left
/// untouched in place.
pub fn extract(text: &str) -> ToolCallExtraction {
    let mut calls = Vec::new();
    let mut removals: Vec<(usize, usize)> = Vec::new();

    let mut search_from = 0usize;
    while let Some(rel) = text[search_from..].find(MARKER) {
        let marker_start = search_from + rel;
        let open_bracket_idx = marker_start + MARKER.len() - 1;
        match find_matching_bracket(text, open_bracket_idx) {
            Some(close_idx) => {
                let array_text = &text[open_bracket_idx..=close_idx];
                match serde_json::from_str::<Value>(array_text) {
                    Ok(value) => {
                        calls.extend(parse_entries(&value));
                        let (rs, re) =
                            expand_to_enclosing_braces(text, marker_start, close_idx + 1);
                        removals.push((rs, re));
                    }
                    Err(_) => {
                        // Leave malformed segments in place.
                    }
                }
                search_from = close_idx + 1;
            }
            None => break,
        }
    }

    let cleaned = if removals.is_empty() {
        text.to_string()
    } else {
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0usize;
        for (rs, re) in removals {
            out.push_str(&text[cursor..rs]);
            cursor = re;
        }
        out.push_str(&text[cursor..]);
        out
    };

    ToolCallExtraction { cleaned, calls }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_call_with_string_arguments() {
        let text = r#"Running a command. {"tool_calls":[{"type":"function","function":{"name":"sh","arguments":"{\"cmd\":\"echo hi\"}"}}]} Done."#;
        let result = extract(text);
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].name, "sh");
        assert!(result.calls[0].arguments.contains("echo hi"));
        assert!(!result.cleaned.contains("tool_calls"));
        assert!(result.cleaned.contains("Running a command."));
        assert!(result.cleaned.contains("Done."));
    }

    #[test]
    fn normalizes_object_arguments_to_string() {
        let text = r#"{"tool_calls":[{"type":"function","function":{"name":"sh","arguments":{"cmd":"ls"}}}]}"#;
        let result = extract(text);
        assert_eq!(result.calls.len(), 1);
        assert!(result.calls[0].arguments.contains("\"cmd\""));
    }

    #[test]
    fn no_marker_leaves_text_untouched() {
        let result = extract("just plain assistant text");
        assert!(result.calls.is_empty());
        assert_eq!(result.cleaned, "just plain assistant text");
    }

    #[test]
    fn handles_brackets_inside_string_arguments() {
        let text = r#"{"tool_calls":[{"type":"function","function":{"name":"sh","arguments":"{\"cmd\":\"echo [1,2]\"}"}}]}"#;
        let result = extract(text);
        assert_eq!(result.calls.len(), 1);
        assert!(result.calls[0].arguments.contains("[1,2]"));
    }

    #[test]
    fn malformed_segment_left_in_place() {
        let text = r#"before "tool_calls":[ not json after"#;
        let result = extract(text);
        assert!(result.calls.is_empty());
        assert_eq!(result.cleaned, text);
    }
}
