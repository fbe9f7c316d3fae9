//! Bounded context window for the agent loop
//!
//! Holds the most recent step records. When a record is evicted it is folded
//! into a one-line entry of a running summary, which is itself capped so the
//! prompt stays bounded no matter how long the session runs.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::Screenshot;

/// Share of a truncated output kept from its beginning
const HEAD_RATIO: f64 = 0.75;

/// Longest arguments or output rendered into one summary line
const SUMMARY_FIELD_CHARS: usize = 120;

/// What the loop saw before deciding
#[derive(Debug, Clone)]
pub struct Observation {
    pub screenshot: Screenshot,
    /// Structured page elements, when the browser could provide them
    pub elements: Option<Value>,
    pub captured_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(screenshot: Screenshot, elements: Option<Value>) -> Self {
        Self {
            screenshot,
            elements,
            captured_at: Utc::now(),
        }
    }

    /// Short textual description stored in step records
    pub fn describe(&self) -> String {
        let mut text = format!(
            "screenshot {}x{} {}",
            self.screenshot.width, self.screenshot.height, self.screenshot.format
        );
        if let Some(count) = self.elements.as_ref().and_then(element_count) {
            text.push_str(&format!(", {} page elements", count));
        }
        text
    }
}

fn element_count(elements: &Value) -> Option<usize> {
    match elements {
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => map.get("elements").and_then(Value::as_array).map(Vec::len),
        _ => None,
    }
}

/// The tool call the model chose for a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
}

/// Result of executing a step's tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub ok: bool,
    /// Payload or error text, already truncated
    pub output: String,
}

/// One completed observe → decide → act cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u32,
    pub observation: String,
    pub decision: ToolInvocation,
    pub outcome: ActionOutcome,
    pub timestamp: DateTime<Utc>,
}

impl StepRecord {
    fn summary_line(&self) -> String {
        let status = if self.outcome.ok { "ok" } else { "error" };
        format!(
            "step {}: {}({}) -> {}: {}",
            self.step,
            self.decision.name,
            clip(&self.decision.arguments.to_string(), SUMMARY_FIELD_CHARS),
            status,
            clip(&self.outcome.output, SUMMARY_FIELD_CHARS).replace('\n', " ")
        )
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}…", &text[..end]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct ContextWindow {
    task: String,
    capacity: usize,
    summary_limit: usize,
    records: VecDeque<StepRecord>,
    summary: VecDeque<String>,
    summary_chars: usize,
    evicted: usize,
}

impl ContextWindow {
    /// `capacity` is clamped to at least one record
    pub fn new(task: impl Into<String>, capacity: usize, summary_limit: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            task: task.into(),
            capacity,
            summary_limit,
            records: VecDeque::with_capacity(capacity),
            summary: VecDeque::new(),
            summary_chars: 0,
            evicted: 0,
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records evicted so far
    pub fn evicted(&self) -> usize {
        self.evicted
    }

    pub fn records(&self) -> impl Iterator<Item = &StepRecord> {
        self.records.iter()
    }

    /// Folded account of evicted steps, oldest first
    pub fn summary(&self) -> Option<String> {
        if self.summary.is_empty() {
            return None;
        }
        let mut text = String::new();
        if self.evicted > self.summary.len() {
            text.push_str(&format!(
                "({} earlier steps omitted)\n",
                self.evicted - self.summary.len()
            ));
        }
        for line in &self.summary {
            text.push_str(line);
            text.push('\n');
        }
        Some(text)
    }

    pub fn push(&mut self, record: StepRecord) {
        if self.records.len() == self.capacity {
            if let Some(oldest) = self.records.pop_front() {
                self.fold(&oldest);
            }
        }
        self.records.push_back(record);
    }

    fn fold(&mut self, record: &StepRecord) {
        self.evicted += 1;
        let line = record.summary_line();
        self.summary_chars += line.chars().count();
        self.summary.push_back(line);

        while self.summary_chars > self.summary_limit && self.summary.len() > 1 {
            if let Some(dropped) = self.summary.pop_front() {
                self.summary_chars -= dropped.chars().count();
            }
        }
    }
}

/// Keep the head and tail of `text` when it exceeds `max_chars`
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let head_len = (max_chars as f64 * HEAD_RATIO) as usize;
    let tail_len = max_chars - head_len;

    let head: String = text.chars().take(head_len).collect();
    let tail: String = text.chars().skip(total - tail_len).collect();
    format!(
        "{}\n\n... [{} chars truncated] ...\n\n{}",
        head,
        total - max_chars,
        tail
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(step: u32) -> StepRecord {
        StepRecord {
            step,
            observation: "screenshot 10x10 png".to_string(),
            decision: ToolInvocation {
                name: "click".to_string(),
                arguments: json!({"x": step, "y": 1}),
            },
            outcome: ActionOutcome {
                ok: true,
                output: "done".to_string(),
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut window = ContextWindow::new("task", 3, 10_000);
        for step in 1..=10 {
            window.push(record(step));
            assert!(window.len() <= 3);
        }
        let steps: Vec<u32> = window.records().map(|r| r.step).collect();
        assert_eq!(steps, vec![8, 9, 10]);
        assert_eq!(window.evicted(), 7);
    }

    #[test]
    fn test_evicted_records_are_summarized() {
        let mut window = ContextWindow::new("task", 1, 10_000);
        assert!(window.summary().is_none());
        window.push(record(1));
        window.push(record(2));

        let summary = window.summary().unwrap();
        assert!(summary.contains("step 1: click"));
        assert!(!summary.contains("step 2"));
    }

    #[test]
    fn test_summary_is_bounded() {
        let mut window = ContextWindow::new("task", 1, 100);
        for step in 1..=50 {
            window.push(record(step));
        }
        let summary = window.summary().unwrap();
        assert!(summary.starts_with("("));
        assert!(summary.contains("step 49"));
        assert!(!summary.contains("step 1:"));
    }

    #[test]
    fn test_summary_clips_long_arguments() {
        let mut window = ContextWindow::new("task", 1, 500);
        let mut typing = record(1);
        typing.decision = ToolInvocation {
            name: "type_text".to_string(),
            arguments: json!({"text": "x".repeat(100_000)}),
        };
        typing.outcome.output = "y".repeat(10_000);
        window.push(typing);
        window.push(record(2));

        let summary = window.summary().unwrap();
        assert!(summary.starts_with("step 1: type_text({\"text\":\"xxx"));
        assert!(summary.contains("…) -> ok"));
        assert!(summary.chars().count() <= 500);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut window = ContextWindow::new("task", 0, 100);
        window.push(record(1));
        assert_eq!(window.capacity(), 1);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_truncate_output_keeps_head_and_tail() {
        let text = format!("{}{}", "a".repeat(300), "z".repeat(100));
        let truncated = truncate_output(&text, 100);
        assert!(truncated.starts_with(&"a".repeat(75)));
        assert!(truncated.ends_with(&"z".repeat(25)));
        assert!(truncated.contains("[300 chars truncated]"));

        assert_eq!(truncate_output("short", 100), "short");
    }
}
