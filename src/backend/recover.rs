//! Recover tool calls that a model wrote into its text reply
//!
//! Some models answer with `{"name": "click", "arguments": {...}}` in the
//! content instead of using the native tool-call field.

use serde_json::Value;

use super::ReplyToolCall;

/// Extract every JSON object in `content` that looks like a tool call
pub fn parse_tool_calls_from_text(content: &str) -> Vec<ReplyToolCall> {
    let content = strip_code_fence(content.trim());

    if let Some(call) = try_parse_tool_call(content) {
        return vec![call];
    }

    let mut calls = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in content.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        if let Some(call) = try_parse_tool_call(&content[s..=i]) {
                            calls.push(call);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    calls
}

fn strip_code_fence(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("```") else {
        return content;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn try_parse_tool_call(text: &str) -> Option<ReplyToolCall> {
    let value: Value = serde_json::from_str(text).ok()?;
    // {"function": {...}} wrapper used by some chat templates
    let value = value.get("function").cloned().unwrap_or(value);

    let name = value.get("name").and_then(Value::as_str)?;
    let arguments = value
        .get("arguments")
        .or_else(|| value.get("parameters"))
        .cloned()
        .unwrap_or(Value::Object(Default::default()));

    // Arguments sometimes arrive double-encoded
    let arguments = match arguments {
        Value::String(inner) => serde_json::from_str(&inner).unwrap_or(Value::String(inner)),
        other => other,
    };

    Some(ReplyToolCall {
        name: name.to_string(),
        arguments,
    })
}
