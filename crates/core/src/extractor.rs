//! Incremental extraction of tool calls from streamed model text.
//!
//! The model is asked to answer with `{"action": ..., "params": {...}}`
//! objects. Text arrives in arbitrary fragments, so the extractor keeps a
//! buffer and pulls out every object that is structurally complete as soon as
//! its closing brace arrives, without waiting for the stream to end.
//!
//! Objects are found by counting braces. Braces inside JSON string literals
//! are counted like any other brace, so a call whose string arguments contain
//! unbalanced braces is only recognised when it makes up the whole buffer.

use crate::types::ToolInvocation;
use std::ops::Range;

/// Accumulates deltas and yields complete tool invocations
#[derive(Debug, Default, Clone)]
pub struct ActionExtractor {
    buffer: String,
    /// Everything before this offset is at brace depth 0 and already scanned
    scanned: usize,
}

impl ActionExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &str) {
        self.buffer.push_str(delta);
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// True when the buffer holds nothing but whitespace
    pub fn is_empty(&self) -> bool {
        self.buffer.trim().is_empty()
    }

    /// Pull every complete invocation out of the buffer, in order of appearance.
    ///
    /// Emitted objects are removed from the buffer. Narration, malformed
    /// spans and an incomplete trailing object stay buffered.
    pub fn extract(&mut self) -> Vec<ToolInvocation> {
        let trimmed = self.buffer.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        if trimmed.starts_with('{') && trimmed.ends_with('}') {
            if let Some(invocation) = parse_action(trimmed) {
                self.buffer.clear();
                self.scanned = 0;
                return vec![invocation];
            }
        }

        let (found, resume) = scan_from(&self.buffer, self.scanned);
        if found.is_empty() {
            self.scanned = resume;
            return Vec::new();
        }

        let mut rest = String::with_capacity(self.buffer.len());
        let mut cursor = 0;
        let mut removed = 0;
        for (span, _) in &found {
            rest.push_str(&self.buffer[cursor..span.start]);
            removed += span.len();
            cursor = span.end;
        }
        rest.push_str(&self.buffer[cursor..]);
        self.buffer = rest;
        self.scanned = resume - removed;

        found.into_iter().map(|(_, invocation)| invocation).collect()
    }

    /// Drain whatever text is left
    pub fn take_remaining(&mut self) -> String {
        self.scanned = 0;
        std::mem::take(&mut self.buffer)
    }
}

/// Find every balanced `{...}` span in `text` that parses as a tool call.
///
/// Returns byte ranges together with the parsed invocation. Spans that do
/// not parse, or parse to objects without `action` and `params`, are skipped.
pub fn scan_actions(text: &str) -> Vec<(Range<usize>, ToolInvocation)> {
    scan_from(text, 0).0
}

/// Scan `text` starting at `from`, which must be a depth-0 offset.
///
/// Also returns the last offset at which depth was 0: the end of the text
/// when every brace is closed, otherwise the start of the open object.
fn scan_from(text: &str, from: usize) -> (Vec<(Range<usize>, ToolInvocation)>, usize) {
    let mut found = Vec::new();
    let mut depth = 0usize;
    let mut start = None;

    for (index, ch) in text[from..].char_indices() {
        let index = from + index;
        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(index);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(begin) = start.take() {
                        let span = begin..index + 1;
                        if let Some(invocation) = parse_action(&text[span.clone()]) {
                            found.push((span, invocation));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    (found, start.unwrap_or(text.len()))
}

fn parse_action(candidate: &str) -> Option<ToolInvocation> {
    let value: serde_json::Value = serde_json::from_str(candidate).ok()?;
    ToolInvocation::from_value(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_object_emitted_only_when_complete() {
        let mut extractor = ActionExtractor::new();

        extractor.push(r#"{"action":"list"#);
        assert!(extractor.extract().is_empty());
        extractor.push(r#"Files","param"#);
        assert!(extractor.extract().is_empty());
        extractor.push(r#"s":{"path":"."}}"#);

        let actions = extractor.extract();
        assert_eq!(
            actions,
            vec![ToolInvocation::new("listFiles", json!({"path": "."}))]
        );
        assert!(extractor.is_empty());
    }

    #[test]
    fn test_back_to_back_objects_emitted_in_order() {
        let mut extractor = ActionExtractor::new();
        extractor.push(concat!(
            r#"{"action":"search","params":{"query":"cows"}}"#,
            r#"{"action":"writeFile","params":{"path":"cows.txt","content":"..."}}"#
        ));

        let actions = extractor.extract();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action, "search");
        assert_eq!(actions[0].params, json!({"query": "cows"}));
        assert_eq!(actions[1].action, "writeFile");
        assert_eq!(actions[1].params["path"], "cows.txt");
        assert!(extractor.is_empty());
    }

    #[test]
    fn test_narration_is_ignored_and_retained() {
        let mut extractor = ActionExtractor::new();
        extractor.push("Sure, let me look.\n{\"action\":\"readFile\",\"params\":{\"path\":\"a.txt\"}}\nDone.");

        let actions = extractor.extract();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, "readFile");
        assert_eq!(extractor.buffer(), "Sure, let me look.\n\nDone.");
    }

    #[test]
    fn test_every_embedded_call_found_left_to_right() {
        let calls = vec![
            ToolInvocation::new("math", json!({"expression": "2+2"})),
            ToolInvocation::new("grep", json!({"pattern": "fn main", "path": "src"})),
            ToolInvocation::new("zip", json!({"source": "a", "destination": "a.zip"})),
            ToolInvocation::new("exec", json!({"command": "ls", "timeout_ms": 500})),
        ];
        let separators = ["", " ", "\n\n", " then ", "\nand also: "];

        for separator in separators {
            let text = calls
                .iter()
                .map(|call| call.to_json())
                .collect::<Vec<_>>()
                .join(separator);
            let text = format!("Plan:{}{}{}end", separator, text, separator);

            let found: Vec<_> = scan_actions(&text).into_iter().map(|(_, a)| a).collect();
            assert_eq!(found, calls, "separator {:?}", separator);
        }
    }

    #[test]
    fn test_trailing_partial_object_is_kept() {
        let mut extractor = ActionExtractor::new();
        extractor.push(r#"{"action":"search","params":{"query":"cows"}} {"action":"wri"#);

        let first = extractor.extract();
        assert_eq!(first.len(), 1);
        assert_eq!(extractor.buffer(), r#" {"action":"wri"#);

        extractor.push(r#"teFile","params":{"path":"cows.txt","content":"moo"}}"#);
        let second = extractor.extract();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].action, "writeFile");
        assert!(extractor.is_empty());
    }

    #[test]
    fn test_malformed_and_unrelated_objects_skipped() {
        let mut extractor = ActionExtractor::new();
        extractor.push(r#"{oops} {"note":"hi"} {"action":"math","params":{"expression":"1+1"}}"#);

        let actions = extractor.extract();
        assert_eq!(actions, vec![ToolInvocation::new("math", json!({"expression": "1+1"}))]);
        assert_eq!(extractor.buffer(), r#"{oops} {"note":"hi"} "#);
    }

    #[test]
    fn test_plain_text_produces_nothing() {
        let mut extractor = ActionExtractor::new();
        extractor.push("The answer is 42.");

        assert!(extractor.extract().is_empty());
        assert_eq!(extractor.take_remaining(), "The answer is 42.");
        assert!(extractor.is_empty());
    }

    #[test]
    fn test_whole_buffer_fast_path_handles_braces_in_strings() {
        let mut extractor = ActionExtractor::new();
        extractor.push("  {\"action\":\"writeFile\",\"params\":{\"path\":\"x.rs\",\"content\":\"fn f() {\"}}  ");

        let actions = extractor.extract();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].params["content"], "fn f() {");
    }

    #[test]
    fn test_brace_inside_string_is_not_understood_mid_text() {
        // Known limitation of the brace counter: the `}` inside the string
        // closes the object early, the span fails to parse and is dropped.
        let text = r#"Result: {"action":"echo","params":{"text":"a}b"}}"#;
        assert!(scan_actions(text).is_empty());

        let mut extractor = ActionExtractor::new();
        extractor.push(text);
        assert!(extractor.extract().is_empty());
        assert_eq!(extractor.buffer(), text);
    }

    #[test]
    fn test_long_narration_resumes_where_scanning_stopped() {
        let mut extractor = ActionExtractor::new();
        for i in 0..2_000 {
            extractor.push(&format!("word {} ", i));
            assert!(extractor.extract().is_empty());
        }
        assert_eq!(extractor.scanned, extractor.buffer().len());

        // An object opened across deltas is rescanned from its opening brace
        extractor.push("then {\"action\":\"math\",");
        assert!(extractor.extract().is_empty());
        let open = extractor.buffer().rfind('{').unwrap();
        assert_eq!(extractor.scanned, open);

        extractor.push("\"params\":{\"expression\":\"1+1\"}} done");
        let actions = extractor.extract();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].params["expression"], "1+1");
        assert!(extractor.buffer().ends_with("then  done"));
        assert_eq!(extractor.scanned, extractor.buffer().len());

        // Nothing already emitted comes back
        extractor.push(" {\"action\":\"echo\",\"params\":{}}");
        let actions = extractor.extract();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, "echo");
        assert!(extractor.extract().is_empty());
    }

    #[test]
    fn test_nested_params_survive() {
        let text = r#"{"action":"fetchUrl","params":{"url":"https://docs.rs","headers":{"accept":"text/html"}}}"#;
        let found = scan_actions(&format!("x {} y", text));

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, 2..2 + text.len());
        assert_eq!(found[0].1.params["headers"]["accept"], "text/html");
    }
}
