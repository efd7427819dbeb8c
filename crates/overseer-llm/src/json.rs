//! JSON recovery for model output.
//!
//! Models wrap JSON in prose and fences, and truncated responses arrive with
//! unterminated strings and unbalanced brackets. `extract` finds the document;
//! `repair_truncated` is a best-effort patch applied only when the provider
//! reported a max-tokens stop.

/// Extract the first JSON document from model output, preferring a fenced
/// ```json block. Returns the raw (possibly truncated) document text.
pub fn extract(text: &str) -> Option<String> {
    if let Some(start) = text.find("```json") {
        let after_fence = &text[start + "```json".len()..];
        let body = after_fence.strip_prefix('\n').unwrap_or(after_fence);
        let doc = match body.find("```") {
            Some(end) => &body[..end],
            None => body, // unclosed fence: truncated output
        };
        let doc = doc.trim();
        if !doc.is_empty() {
            return Some(doc.to_string());
        }
    }

    let start = text.find(['{', '['])?;
    Some(balanced_prefix(&text[start..]).to_string())
}

/// The shortest prefix that forms a balanced JSON document, or the whole
/// input when it never closes (truncation).
fn balanced_prefix(text: &str) -> &str {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    for (i, c) in text.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &text[..i + c.len_utf8()];
                }
            }
            _ => {}
        }
    }
    text
}

/// Patch a truncated JSON document: terminate a dangling string, finish a cut
/// literal or number, drop a trailing comma, null a dangling key, and close
/// open brackets.
pub fn repair_truncated(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape = false;
    // Significant char preceding the string currently/last being read; tells
    // key position ('{' or ',') apart from value position (':').
    let mut sig_before_string = None;
    let mut last_sig = None;

    for c in input.chars() {
        if in_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
                last_sig = Some('"');
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                sig_before_string = last_sig;
                out.push(c);
            }
            '{' | '[' => {
                stack.push(if c == '{' { '}' } else { ']' });
                last_sig = Some(c);
                out.push(c);
            }
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
                last_sig = Some(c);
                out.push(c);
            }
            c if c.is_whitespace() => out.push(c),
            _ => {
                last_sig = Some(c);
                out.push(c);
            }
        }
    }

    if escape {
        out.pop(); // dangling backslash cut mid-escape
    }
    if in_string {
        out.push('"');
    }

    complete_literal(&mut out);
    trim_number_tail(&mut out);

    loop {
        let end = out.trim_end().len();
        out.truncate(end);
        if out.ends_with(',') {
            out.pop();
            continue;
        }
        break;
    }

    if out.ends_with(':') {
        out.push_str(" null");
    } else if out.ends_with('"')
        && matches!(sig_before_string, Some('{') | Some(','))
        && stack.last() == Some(&'}')
    {
        // The cut landed right after an object key.
        out.push_str(": null");
    }

    for close in stack.into_iter().rev() {
        out.push(close);
    }
    out
}

/// Finish a literal cut mid-word (`tru`, `fals`, `nul`).
fn complete_literal(out: &mut String) {
    let tail_start = out
        .rfind(|c: char| !c.is_ascii_alphabetic())
        .map(|i| i + 1)
        .unwrap_or(0);
    let tail = &out[tail_start..];
    if tail.is_empty() {
        return;
    }
    for literal in ["true", "false", "null"] {
        if literal.starts_with(tail) && tail.len() < literal.len() {
            let rest = literal[tail.len()..].to_string();
            out.push_str(&rest);
            return;
        }
    }
}

/// Drop characters that cannot end a JSON number (`12.`, `3e`, `-`).
fn trim_number_tail(out: &mut String) {
    while matches!(out.chars().last(), Some('.' | '-' | '+' | 'e' | 'E')) {
        out.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn parses(s: &str) -> Value {
        serde_json::from_str(s).unwrap_or_else(|e| panic!("not valid JSON ({}): {}", e, s))
    }

    #[test]
    fn extract_prefers_fenced_block() {
        let text = "Here is the plan {not json}:\n```json\n{\"a\": 1}\n```\ntrailing";
        assert_eq!(extract(text).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn extract_unclosed_fence_returns_truncated_body() {
        let text = "```json\n{\"a\": [1, 2";
        assert_eq!(extract(text).unwrap(), "{\"a\": [1, 2");
    }

    #[test]
    fn extract_bare_document() {
        let text = "The result is {\"a\": {\"b\": 2}} and more prose";
        assert_eq!(extract(text).unwrap(), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn extract_ignores_braces_inside_strings() {
        let text = r#"{"a": "has } brace"} extra"#;
        assert_eq!(extract(text).unwrap(), r#"{"a": "has } brace"}"#);
    }

    #[test]
    fn extract_none_without_document() {
        assert!(extract("no json here at all").is_none());
    }

    #[test]
    fn repair_trailing_comma() {
        let fixed = repair_truncated(r#"{"a": [1, 2,"#);
        assert_eq!(parses(&fixed)["a"], serde_json::json!([1, 2]));
    }

    #[test]
    fn repair_unterminated_string_value() {
        let fixed = repair_truncated(r#"{"nodes": [{"id": "a"}, {"id": "b"#);
        let v = parses(&fixed);
        assert_eq!(v["nodes"][1]["id"], "b");
    }

    #[test]
    fn repair_dangling_key() {
        let fixed = repair_truncated(r#"{"a": 1, "b"#);
        let v = parses(&fixed);
        assert_eq!(v["a"], 1);
        assert!(v["b"].is_null());
    }

    #[test]
    fn repair_dangling_colon() {
        let fixed = repair_truncated(r#"{"a": "x", "b":"#);
        let v = parses(&fixed);
        assert!(v["b"].is_null());
    }

    #[test]
    fn repair_cut_literal() {
        let fixed = repair_truncated(r#"{"done": tru"#);
        assert_eq!(parses(&fixed)["done"], true);
    }

    #[test]
    fn repair_cut_number() {
        let fixed = repair_truncated(r#"{"ratio": 12."#);
        assert_eq!(parses(&fixed)["ratio"], 12);
    }

    #[test]
    fn repair_mid_escape() {
        let fixed = repair_truncated(r#"{"text": "line\"#);
        let v = parses(&fixed);
        assert_eq!(v["text"], "line");
    }

    #[test]
    fn repair_leaves_complete_document_alone() {
        let doc = r#"{"a": [1, 2], "b": {"c": true}}"#;
        assert_eq!(repair_truncated(doc), doc);
    }
}
