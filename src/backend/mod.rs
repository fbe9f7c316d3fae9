//! Vision/reasoning backend adapter
//!
//! [`ReasoningAdapter`] turns a context window and an observation into a
//! [`Decision`] using one of two HTTP backends:
//!
//! - `local`: a model runner speaking the Ollama `/api/chat` API
//! - `hosted`: an OpenAI-compatible `/chat/completions` endpoint
//!
//! Both go through the same reply interpretation, so malformed replies are
//! handled identically and retried with the configured backoff.

pub mod error;
pub mod hosted;
pub mod local;
pub mod prompt;
pub mod recover;
pub mod tools;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info_span, Instrument};

pub use error::{BackendError, DecisionError};
pub use hosted::HostedBackend;
pub use local::LocalBackend;
pub use prompt::{PromptMessage, DEFAULT_SYSTEM_PROMPT};
pub use tools::{ToolSpec, FINISH_TOOL};

use crate::agent::context::{ContextWindow, Observation};
use crate::config::BackendConfig;
use crate::metrics::{BACKEND_CALLS, BACKEND_CALL_DURATION};
use crate::retry::RetryPolicy;

/// Which backend family to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Hosted,
}

/// What the model wants to happen next
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    ToolCall { name: String, arguments: Value },
    Completion { success: bool, reason: String },
}

/// Source of decisions for the agent loop
#[async_trait]
pub trait DecisionSource: Send + Sync {
    async fn decide(
        &self,
        context: &ContextWindow,
        observation: &Observation,
    ) -> Result<Decision, DecisionError>;
}

/// A tool call as returned by a backend
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Raw assistant reply, before interpretation
#[derive(Debug, Clone, Default)]
pub struct ModelReply {
    pub content: String,
    pub tool_calls: Vec<ReplyToolCall>,
}

/// One request/response exchange with a model server
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Label used in logs and metrics
    fn name(&self) -> &'static str;

    async fn complete(
        &self,
        messages: &[PromptMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, BackendError>;
}

/// Build the backend selected by `config`
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn ReasoningBackend>, BackendError> {
    match config.kind {
        BackendKind::Local => Ok(Arc::new(LocalBackend::new(
            config.local_url.clone(),
            config.model.clone(),
            config.temperature,
            config.request_timeout,
        )?)),
        BackendKind::Hosted => {
            if config.hosted_url.is_empty() {
                return Err(BackendError::Config("hosted backend needs a base url".to_string()));
            }
            Ok(Arc::new(HostedBackend::new(
                config.hosted_url.clone(),
                config.api_key.clone(),
                config.model.clone(),
                config.temperature,
                config.max_tokens,
                config.request_timeout,
            )?))
        }
    }
}

/// Map a raw reply onto a decision
///
/// Native tool calls win, then calls recovered from the text. A reply with
/// text but no call is a successful completion; an empty reply is malformed.
pub fn interpret(reply: ModelReply) -> Result<Decision, BackendError> {
    let mut calls = reply.tool_calls;
    if calls.is_empty() {
        calls = recover::parse_tool_calls_from_text(&reply.content);
    }

    if let Some(call) = calls.into_iter().next() {
        if call.name.is_empty() {
            return Err(BackendError::Malformed("tool call without a name".to_string()));
        }
        if call.name == FINISH_TOOL {
            let success = match call.arguments.get("success") {
                Some(Value::Bool(b)) => *b,
                Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
                _ => true,
            };
            let reason = call
                .arguments
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| reply.content.trim().to_string());
            return Ok(Decision::Completion { success, reason });
        }
        return Ok(Decision::ToolCall {
            name: call.name,
            arguments: call.arguments,
        });
    }

    let text = reply.content.trim();
    if text.is_empty() {
        return Err(BackendError::Malformed(
            "reply has neither tool calls nor text".to_string(),
        ));
    }
    Ok(Decision::Completion {
        success: true,
        reason: text.to_string(),
    })
}

/// [`DecisionSource`] backed by an HTTP model server, with retries
pub struct ReasoningAdapter {
    backend: Arc<dyn ReasoningBackend>,
    system_prompt: String,
    tools: Vec<ToolSpec>,
    retry: RetryPolicy,
}

impl ReasoningAdapter {
    pub fn new(
        backend: Arc<dyn ReasoningBackend>,
        system_prompt: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            system_prompt: system_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            tools: tools::catalog(),
            retry,
        }
    }

    async fn attempt(&self, messages: &[PromptMessage]) -> Result<Decision, BackendError> {
        let backend = self.backend.name();
        let started = Instant::now();
        let result = self
            .backend
            .complete(messages, &self.tools)
            .await
            .and_then(interpret);

        BACKEND_CALL_DURATION
            .with_label_values(&[backend])
            .observe(started.elapsed().as_secs_f64());
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.outcome(),
        };
        BACKEND_CALLS.with_label_values(&[backend, outcome]).inc();
        result
    }
}

#[async_trait]
impl DecisionSource for ReasoningAdapter {
    async fn decide(
        &self,
        context: &ContextWindow,
        observation: &Observation,
    ) -> Result<Decision, DecisionError> {
        let messages = prompt::build(&self.system_prompt, context, observation);
        let span = info_span!("backend_decide", backend = self.backend.name(), otel.name = "backend_decide");

        async {
            let mut attempts = 0;
            loop {
                attempts += 1;
                match self.attempt(&messages).await {
                    Ok(decision) => {
                        tracing::debug!(attempts, ?decision, "decision received");
                        return Ok(decision);
                    }
                    Err(e) if !e.is_retryable() => {
                        tracing::error!(error = %e, "backend call failed");
                        return Err(DecisionError::Fatal(e));
                    }
                    Err(e) if !self.retry.allows_retry(attempts) => {
                        tracing::error!(attempts, error = %e, "backend retries exhausted");
                        return Err(DecisionError::Exhausted { attempts, last: e });
                    }
                    Err(e) => {
                        let delay = self.retry.backoff(attempts);
                        tracing::warn!(
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "backend call failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(content: &str, calls: Vec<ReplyToolCall>) -> ModelReply {
        ModelReply {
            content: content.to_string(),
            tool_calls: calls,
        }
    }

    #[test]
    fn test_native_tool_call() {
        let decision = interpret(reply(
            "",
            vec![ReplyToolCall {
                name: "click".to_string(),
                arguments: json!({"x": 1, "y": 2}),
            }],
        ))
        .unwrap();
        assert_eq!(
            decision,
            Decision::ToolCall {
                name: "click".to_string(),
                arguments: json!({"x": 1, "y": 2})
            }
        );
    }

    #[test]
    fn test_finish_task_is_completion() {
        let decision = interpret(reply(
            "",
            vec![ReplyToolCall {
                name: FINISH_TOOL.to_string(),
                arguments: json!({"success": false, "reason": "login required"}),
            }],
        ))
        .unwrap();
        assert_eq!(
            decision,
            Decision::Completion {
                success: false,
                reason: "login required".to_string()
            }
        );
    }

    #[test]
    fn test_text_only_reply_completes() {
        assert_eq!(
            interpret(reply("All steps passed.", vec![])).unwrap(),
            Decision::Completion {
                success: true,
                reason: "All steps passed.".to_string()
            }
        );
    }

    #[test]
    fn test_tool_call_recovered_from_text() {
        let decision = interpret(reply(r#"{"name": "wait", "arguments": {"seconds": 2}}"#, vec![])).unwrap();
        assert!(matches!(decision, Decision::ToolCall { name, .. } if name == "wait"));
    }

    #[test]
    fn test_empty_reply_is_malformed() {
        assert!(matches!(
            interpret(reply("   ", vec![])),
            Err(BackendError::Malformed(_))
        ));
    }
}
