//! Prompt assembly shared by both backends

use serde_json::Value;

use crate::agent::context::{ContextWindow, Observation};
use crate::protocol::Screenshot;

/// Default system prompt for the desktop/browser agent
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an automation agent operating a Linux desktop (XFCE on display :0) with a Chromium browser.

Each turn you receive the task, a summary of earlier steps, the most recent steps and a screenshot of the current screen. Choose exactly ONE tool call per turn.

Tools:
- click, hover, drag: mouse actions at pixel coordinates read from the screenshot
- type_text, key_press: keyboard input into the focused window
- scroll, wait: move the view, or pause while something loads
- run_command: run a shell command and read its output
- browser_navigate, browser_click, browser_type: drive the browser (element indices come from the element list when present)
- launch_app, check_app_installed: desktop applications
- finish_task: report the final result

Rules:
- Base every action on what the current screenshot shows. Never assume a previous action worked; verify it.
- If a step fails, read the error and adapt instead of repeating the same call.
- Never pretend the task succeeded. If it cannot be completed, call finish_task with success=false and explain why.
- When the task is done, call finish_task with success=true."#;

/// A backend-neutral chat message
#[derive(Debug, Clone)]
pub struct PromptMessage {
    pub role: Role,
    pub text: String,
    pub image: Option<Screenshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
        }
    }
}

/// Build the two-message prompt for one decision
pub fn build(system_prompt: &str, context: &ContextWindow, observation: &Observation) -> Vec<PromptMessage> {
    let mut text = format!("TASK:\n{}\n", context.task());

    if let Some(summary) = context.summary() {
        text.push_str("\nEARLIER STEPS (summarized):\n");
        text.push_str(&summary);
    }

    if !context.is_empty() {
        text.push_str("\nRECENT STEPS:\n");
        for record in context.records() {
            let status = if record.outcome.ok { "ok" } else { "error" };
            text.push_str(&format!(
                "- step {}: {}({}) -> {}\n  {}\n",
                record.step,
                record.decision.name,
                record.decision.arguments,
                status,
                record.outcome.output.replace('\n', "\n  ")
            ));
        }
    }

    if let Some(elements) = &observation.elements {
        text.push_str("\nPAGE ELEMENTS:\n");
        // Prefer the executor's one-line-per-element listing over raw JSON
        match elements.get("listing").and_then(Value::as_str) {
            Some(listing) => text.push_str(listing),
            None => text.push_str(&elements.to_string()),
        }
        text.push('\n');
    }

    text.push_str(&format!(
        "\nThe attached screenshot ({}x{}) shows the current screen. Choose the next action.",
        observation.screenshot.width, observation.screenshot.height
    ));

    vec![
        PromptMessage {
            role: Role::System,
            text: system_prompt.to_string(),
            image: None,
        },
        PromptMessage {
            role: Role::User,
            text,
            image: Some(observation.screenshot.clone()),
        },
    ]
}
