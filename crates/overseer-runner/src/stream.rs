//! Agent output stream parsing.
//!
//! Claude's stream-json mode emits one JSON record per line; the parser keeps
//! a byte buffer across reads and dispatches each newline-terminated record.
//! Other CLIs get their ANSI/OSC decoration stripped line by line.

use overseer_core::OutputStream;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const TEXT_TRUNCATE: usize = 500;
const ERROR_TRUNCATE: usize = 200;

/// One line ready for capture and broadcast.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedLine {
    pub stream: OutputStream,
    pub line: String,
}

impl ParsedLine {
    fn stdout(line: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            line: line.into(),
        }
    }

    fn stderr(line: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            line: line.into(),
        }
    }

    fn system(line: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::System,
            line: line.into(),
        }
    }
}

/// Parser output: captured lines plus out-of-band facts.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamItem {
    Line(ParsedLine),
    /// The concrete model id announced by the agent.
    Model(String),
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // CSI sequences, OSC sequences (BEL or ST terminated), bare escapes,
        // and stray C0 control characters other than tab.
        Regex::new(
            "\x1b\\[[0-9;?]*[ -/]*[@-~]|\x1b\\][^\x07\x1b]*(?:\x07|\x1b\\\\)?|\x1b[@-Z\\\\-_]|[\x00-\x08\x0b-\x1f\x7f]",
        )
        .expect("static regex")
    })
}

/// Remove ANSI escape sequences, OSC titles, and cursor control bytes.
pub fn strip_ansi(s: &str) -> String {
    ansi_re().replace_all(s, "").into_owned()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{}…", cut)
}

fn split_lines(buf: &mut Vec<u8>, bytes: &[u8]) -> Vec<String> {
    buf.extend_from_slice(bytes);
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = buf.drain(..=pos).collect();
        line.pop(); // newline
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).into_owned());
    }
    lines
}

/// Incremental parser for Claude's line-delimited JSON stream.
#[derive(Default)]
pub struct ClaudeStreamParser {
    buf: Vec<u8>,
}

impl ClaudeStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw stdout bytes; returns items for every record completed by
    /// this read.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamItem> {
        let mut items = Vec::new();
        for line in split_lines(&mut self.buf, bytes) {
            self.parse_record(&line, &mut items);
        }
        items
    }

    fn parse_record(&self, line: &str, items: &mut Vec<StreamItem>) {
        if line.trim().is_empty() {
            return;
        }

        let record: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                // Not a JSON record: pass it through, minus terminal decoration.
                let cleaned = strip_ansi(line);
                if !cleaned.trim().is_empty() {
                    items.push(StreamItem::Line(ParsedLine::stdout(cleaned)));
                }
                return;
            }
        };

        match record["type"].as_str() {
            Some("system") => {
                let model = record["model"].as_str().unwrap_or("unknown");
                let tools = record["tools"].as_array().map(|t| t.len()).unwrap_or(0);
                items.push(StreamItem::Model(model.to_string()));
                items.push(StreamItem::Line(ParsedLine::system(format!(
                    "agent started: model {} ({} tools)",
                    model, tools
                ))));
            }
            Some("assistant") => {
                let blocks = record["message"]["content"].as_array();
                for block in blocks.into_iter().flatten() {
                    match block["type"].as_str() {
                        Some("text") => {
                            let text = block["text"].as_str().unwrap_or_default();
                            if !text.trim().is_empty() {
                                items.push(StreamItem::Line(ParsedLine::stdout(truncate_chars(
                                    text,
                                    TEXT_TRUNCATE,
                                ))));
                            }
                        }
                        Some("tool_use") => {
                            let name = block["name"].as_str().unwrap_or("tool");
                            items.push(StreamItem::Line(ParsedLine::stdout(tool_summary(
                                name,
                                &block["input"],
                            ))));
                        }
                        _ => {}
                    }
                }
            }
            Some("tool_result") => {
                if record["is_error"].as_bool().unwrap_or(false) {
                    let content = flatten_content(&record["content"]);
                    items.push(StreamItem::Line(ParsedLine::stderr(format!(
                        "tool error: {}",
                        truncate_chars(&content, ERROR_TRUNCATE)
                    ))));
                }
                // Successful tool results are noise; the tool_use line said enough.
            }
            Some("result") => {
                let turns = record["num_turns"].as_u64().unwrap_or(0);
                let secs = record["duration_ms"].as_u64().unwrap_or(0) as f64 / 1000.0;
                let mut summary = format!("done: {} turns in {:.1}s", turns, secs);
                if let Some(cost) = record["total_cost_usd"].as_f64() {
                    summary.push_str(&format!(" (${:.4})", cost));
                }
                items.push(StreamItem::Line(ParsedLine::system(summary)));
            }
            _ => {}
        }
    }
}

/// One-line summary of a tool invocation: operation plus its salient input.
fn tool_summary(name: &str, input: &Value) -> String {
    let salient = ["path", "file_path", "command", "pattern", "query", "url"]
        .iter()
        .find_map(|key| input[key].as_str());
    match salient {
        Some(detail) => format!("[{}] {}", name, truncate_chars(detail, 120)),
        None => format!("[{}]", name),
    }
}

fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

/// Line splitter for non-Claude CLIs: strip decoration, skip blank lines.
pub struct PlainStreamParser {
    buf: Vec<u8>,
    stream: OutputStream,
}

impl PlainStreamParser {
    pub fn new(stream: OutputStream) -> Self {
        Self {
            buf: Vec::new(),
            stream,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ParsedLine> {
        let stream = self.stream;
        split_lines(&mut self.buf, bytes)
            .into_iter()
            .map(|line| strip_ansi(&line))
            .filter(|line| !line.trim().is_empty())
            .map(|line| ParsedLine { stream, line })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_record_announces_model() {
        let mut p = ClaudeStreamParser::new();
        let items = p.feed(
            br#"{"type":"system","subtype":"init","model":"claude-sonnet-4-20250514","tools":["bash","read"]}
"#,
        );
        assert_eq!(items[0], StreamItem::Model("claude-sonnet-4-20250514".into()));
        match &items[1] {
            StreamItem::Line(l) => {
                assert_eq!(l.stream, OutputStream::System);
                assert!(l.line.contains("claude-sonnet-4-20250514"));
                assert!(l.line.contains("2 tools"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn assistant_text_is_truncated() {
        let long = "x".repeat(800);
        let record = serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": long}]}
        });
        let mut p = ClaudeStreamParser::new();
        let items = p.feed(format!("{}\n", record).as_bytes());
        match &items[0] {
            StreamItem::Line(l) => {
                assert_eq!(l.line.chars().count(), TEXT_TRUNCATE + 1); // 500 + ellipsis
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn tool_use_summarized_with_salient_input() {
        let record = serde_json::json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "name": "read", "input": {"path": "src/main.rs"}},
                {"type": "tool_use", "name": "bash", "input": {"command": "cargo test"}},
                {"type": "tool_use", "name": "grep", "input": {"pattern": "fn main"}}
            ]}
        });
        let mut p = ClaudeStreamParser::new();
        let items = p.feed(format!("{}\n", record).as_bytes());
        let lines: Vec<String> = items
            .iter()
            .map(|i| match i {
                StreamItem::Line(l) => l.line.clone(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(lines[0], "[read] src/main.rs");
        assert_eq!(lines[1], "[bash] cargo test");
        assert_eq!(lines[2], "[grep] fn main");
    }

    #[test]
    fn tool_result_error_surfaces_truncated() {
        let long_err = "E".repeat(400);
        let record = serde_json::json!({"type": "tool_result", "is_error": true, "content": long_err});
        let mut p = ClaudeStreamParser::new();
        let items = p.feed(format!("{}\n", record).as_bytes());
        match &items[0] {
            StreamItem::Line(l) => {
                assert_eq!(l.stream, OutputStream::Stderr);
                assert!(l.line.starts_with("tool error: "));
                assert!(l.line.chars().count() < 250);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn successful_tool_result_suppressed() {
        let record = serde_json::json!({"type": "tool_result", "is_error": false, "content": "file contents"});
        let mut p = ClaudeStreamParser::new();
        assert!(p.feed(format!("{}\n", record).as_bytes()).is_empty());
    }

    #[test]
    fn result_record_summarizes_run() {
        let record = serde_json::json!({
            "type": "result", "num_turns": 7, "duration_ms": 12500, "total_cost_usd": 0.0321
        });
        let mut p = ClaudeStreamParser::new();
        let items = p.feed(format!("{}\n", record).as_bytes());
        match &items[0] {
            StreamItem::Line(l) => {
                assert_eq!(l.stream, OutputStream::System);
                assert_eq!(l.line, "done: 7 turns in 12.5s ($0.0321)");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn malformed_line_emitted_verbatim_without_ansi() {
        let mut p = ClaudeStreamParser::new();
        let items = p.feed(b"\x1b[31mplain warning\x1b[0m\n");
        assert_eq!(
            items,
            vec![StreamItem::Line(ParsedLine::stdout("plain warning"))]
        );
    }

    #[test]
    fn records_split_across_reads() {
        let mut p = ClaudeStreamParser::new();
        let record = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#;
        let (a, b) = record.split_at(30);
        assert!(p.feed(a.as_bytes()).is_empty());
        let mut items = p.feed(b.as_bytes());
        assert!(items.is_empty());
        items.extend(p.feed(b"\n"));
        assert_eq!(items, vec![StreamItem::Line(ParsedLine::stdout("hi"))]);
    }

    #[test]
    fn plain_parser_strips_and_skips_blanks() {
        let mut p = PlainStreamParser::new(OutputStream::Stderr);
        let lines = p.feed(b"\x1b]0;title\x07real output\n\n\x1b[2Kcleared line\n");
        assert_eq!(
            lines,
            vec![
                ParsedLine::stderr("real output"),
                ParsedLine::stderr("cleared line"),
            ]
        );
    }

    #[test]
    fn crlf_handled() {
        let mut p = PlainStreamParser::new(OutputStream::Stdout);
        let lines = p.feed(b"windows line\r\n");
        assert_eq!(lines, vec![ParsedLine::stdout("windows line")]);
    }
}
