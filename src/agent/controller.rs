//! Agent controller - the observe → decide → act loop
//!
//! One call to [`AgentController::run_session`] drives one session to a
//! [`TerminationReason`]. It never panics and never returns early without an
//! outcome: exhausted retries, decision errors, deadlines and cancellation all
//! end up as a reason plus the partial step history.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::context::{truncate_output, ActionOutcome, ContextWindow, Observation, StepRecord, ToolInvocation};
use super::session::{SessionOutcome, StepSink, TerminationReason};
use crate::backend::{tools, Decision, DecisionSource};
use crate::config::AgentConfig;
use crate::controller::{CommandTarget, DispatchError};
use crate::metrics::{SESSIONS, SESSIONS_RUNNING, SESSION_STEPS, STEP_RETRIES};
use crate::protocol::{ActionType, Parameters, Screenshot};

/// Why the loop stopped before reaching a decision of its own
enum Halt {
    Cancelled(String),
    Failed(String),
}

impl Halt {
    fn from_dispatch(phase: &str, error: DispatchError) -> Self {
        match error {
            DispatchError::Cancelled => Halt::Cancelled(format!("cancelled while {}", phase)),
            other => Halt::Failed(format!("{} failed: {}", phase, other)),
        }
    }
}

struct SessionState {
    window: ContextWindow,
    history: Vec<StepRecord>,
    step: u32,
}

/// Runs agent sessions against one command target
pub struct AgentController {
    target: Arc<dyn CommandTarget>,
    decider: Arc<dyn DecisionSource>,
    sink: Arc<dyn StepSink>,
    config: AgentConfig,
}

impl AgentController {
    pub fn new(
        target: Arc<dyn CommandTarget>,
        decider: Arc<dyn DecisionSource>,
        sink: Arc<dyn StepSink>,
        config: AgentConfig,
    ) -> Self {
        Self {
            target,
            decider,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run a session with a fresh id
    pub async fn run(&self, task: &str, cancel: &CancellationToken) -> SessionOutcome {
        self.run_session(Uuid::now_v7().to_string(), task, cancel).await
    }

    /// Run a session until it terminates
    ///
    /// Cancelling `cancel` stops the session promptly with
    /// [`TerminationReason::Cancelled`]; the optional session deadline ends it
    /// with [`TerminationReason::Failure`].
    pub async fn run_session(
        &self,
        session_id: String,
        task: &str,
        cancel: &CancellationToken,
    ) -> SessionOutcome {
        let agent_id = self.target.agent_id().to_string();
        let root_span = info_span!(
            "agent_session",
            session_id = %session_id,
            agent_id = %agent_id,
            otel.name = "agent_session"
        );

        async {
            info!(task = %task, max_steps = self.config.max_steps, "starting agent session");
            SESSIONS_RUNNING.inc();
            self.sink.session_started(&session_id, &agent_id, task).await;
            let started_at = Utc::now();

            let mut state = SessionState {
                window: ContextWindow::new(task, self.config.context_capacity, self.config.summary_chars),
                history: Vec::new(),
                step: 0,
            };

            // The deadline cancels a child token so in-flight dispatches are
            // expired the same way as for caller cancellation
            let session_cancel = cancel.child_token();
            let deadline_timer = self.config.session_deadline.map(|deadline| {
                let token = session_cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(deadline).await;
                    token.cancel();
                })
            });

            let (mut reason, mut detail) = self.drive(&session_id, &mut state, &session_cancel).await;

            if let Some(timer) = deadline_timer {
                timer.abort();
            }
            if reason == TerminationReason::Cancelled && !cancel.is_cancelled() {
                if let Some(deadline) = self.config.session_deadline {
                    reason = TerminationReason::Failure;
                    detail = format!("session deadline of {}s exceeded", deadline.as_secs_f64());
                }
            }

            let outcome = SessionOutcome {
                session_id: session_id.clone(),
                agent_id: agent_id.clone(),
                task: task.to_string(),
                reason,
                detail,
                steps: state.step,
                history: state.history,
                started_at,
                finished_at: Utc::now(),
            };

            SESSIONS_RUNNING.dec();
            SESSIONS.with_label_values(&[reason.as_str()]).inc();
            SESSION_STEPS.observe(outcome.steps as f64);
            match reason {
                TerminationReason::Success => {
                    info!(steps = outcome.steps, detail = %outcome.detail, "agent session succeeded")
                }
                _ => warn!(
                    steps = outcome.steps,
                    reason = reason.as_str(),
                    detail = %outcome.detail,
                    "agent session ended without success"
                ),
            }

            self.sink.record_outcome(&outcome).await;
            outcome
        }
        .instrument(root_span)
        .await
    }

    async fn drive(
        &self,
        session_id: &str,
        state: &mut SessionState,
        cancel: &CancellationToken,
    ) -> (TerminationReason, String) {
        loop {
            // OBSERVING
            let observation = match self.observe(cancel).await {
                Ok(observation) => observation,
                Err(halt) => return halt.into_reason(),
            };

            // DECIDING
            let decision = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return (TerminationReason::Cancelled, "cancelled while deciding".to_string());
                }
                decision = self.decider.decide(&state.window, &observation) => decision,
            };
            let (name, arguments) = match decision {
                Ok(Decision::Completion { success, reason }) => {
                    let verdict = if success {
                        TerminationReason::Success
                    } else {
                        TerminationReason::Failure
                    };
                    return (verdict, reason);
                }
                Ok(Decision::ToolCall { name, arguments }) => (name, arguments),
                Err(e) => return (TerminationReason::Failure, format!("decision failed: {}", e)),
            };

            // ACTING
            let step = state.step + 1;
            let step_span = info_span!("agent_step", step, tool = %name, otel.name = "agent_step");
            let acted = self.act(&name, &arguments, cancel).instrument(step_span).await;

            let (outcome, halt) = match acted {
                Ok(outcome) => (outcome, None),
                Err(Halt::Cancelled(detail)) => return (TerminationReason::Cancelled, detail),
                Err(Halt::Failed(detail)) => (
                    ActionOutcome {
                        ok: false,
                        output: truncate_output(&detail, self.config.output_chars),
                    },
                    Some(detail),
                ),
            };

            let record = StepRecord {
                step,
                observation: observation.describe(),
                decision: ToolInvocation { name, arguments },
                outcome,
                timestamp: Utc::now(),
            };
            state.step = step;
            self.sink.record_step(session_id, &record).await;
            state.history.push(record.clone());
            state.window.push(record);

            if let Some(detail) = halt {
                return (TerminationReason::Failure, detail);
            }
            if state.step >= self.config.max_steps {
                return (
                    TerminationReason::MaxStepsExceeded,
                    format!("reached the limit of {} steps", self.config.max_steps),
                );
            }
        }
    }

    async fn observe(&self, cancel: &CancellationToken) -> Result<Observation, Halt> {
        let payload = self
            .dispatch_with_retry("observe", ActionType::Screenshot, Parameters::new(), self.config.observe_timeout, cancel)
            .await
            .map_err(|e| Halt::from_dispatch("observing", e))?;
        let screenshot = Screenshot::from_payload(&payload)
            .map_err(|e| Halt::Failed(format!("observing failed: {}", e)))?;

        let elements = if self.config.observe_elements {
            match self
                .target
                .execute(ActionType::BrowserGetElements, Parameters::new(), self.config.observe_timeout, cancel)
                .await
            {
                Ok(elements) => Some(elements),
                Err(DispatchError::Cancelled) => {
                    return Err(Halt::Cancelled("cancelled while observing".to_string()))
                }
                Err(e) => {
                    tracing::debug!(error = %e, "page elements unavailable");
                    None
                }
            }
        } else {
            None
        };

        Ok(Observation::new(screenshot, elements))
    }

    /// Execute a tool call; bad tools come back as an error outcome for the model
    async fn act(&self, name: &str, arguments: &Value, cancel: &CancellationToken) -> Result<ActionOutcome, Halt> {
        let (action, parameters) = match tools::to_command(name, arguments) {
            Ok(command) => command,
            Err(message) => {
                warn!(error = %message, "rejected tool call");
                return Ok(ActionOutcome {
                    ok: false,
                    output: message,
                });
            }
        };

        let timeout = self.action_timeout(action, &parameters);
        match self
            .dispatch_with_retry("act", action, parameters, timeout, cancel)
            .await
        {
            Ok(payload) => Ok(ActionOutcome {
                ok: true,
                output: truncate_output(&render_payload(&payload), self.config.output_chars),
            }),
            Err(DispatchError::InvalidCommand(message)) => Ok(ActionOutcome {
                ok: false,
                output: message,
            }),
            Err(DispatchError::Rejected { detail, .. }) => {
                warn!(error = %detail, "remote rejected tool call");
                Ok(ActionOutcome {
                    ok: false,
                    output: detail,
                })
            }
            Err(e) => Err(Halt::from_dispatch(&format!("action {}", name), e)),
        }
    }

    /// `wait` gets its own duration on top of the normal bound
    fn action_timeout(&self, action: ActionType, parameters: &Parameters) -> Duration {
        let base = self.config.action_timeout;
        if action != ActionType::Wait {
            return base;
        }
        let seconds = parameters
            .get("seconds")
            .and_then(Value::as_f64)
            .filter(|s| s.is_finite() && *s > 0.0)
            .unwrap_or(0.0);
        base + Duration::from_secs_f64(seconds.min(3600.0))
    }

    async fn dispatch_with_retry(
        &self,
        phase: &'static str,
        action: ActionType,
        parameters: Parameters,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, DispatchError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.target.execute(action, parameters.clone(), timeout, cancel).await {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_retryable() && self.config.retry.allows_retry(attempts) => {
                    let delay = self.config.retry.backoff(attempts);
                    STEP_RETRIES.with_label_values(&[phase]).inc();
                    warn!(
                        action = action.as_str(),
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "dispatch failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Halt {
    fn into_reason(self) -> (TerminationReason, String) {
        match self {
            Halt::Cancelled(detail) => (TerminationReason::Cancelled, detail),
            Halt::Failed(detail) => (TerminationReason::Failure, detail),
        }
    }
}

/// Text fed back to the model for a successful action
fn render_payload(payload: &Value) -> String {
    match payload {
        Value::Null => "ok".to_string(),
        Value::String(text) => text.clone(),
        Value::Object(map) if map.contains_key("stdout") || map.contains_key("exit_code") => {
            let mut parts = Vec::new();
            if let Some(stdout) = map.get("stdout").and_then(Value::as_str).filter(|s| !s.is_empty()) {
                parts.push(stdout.to_string());
            }
            if let Some(stderr) = map.get("stderr").and_then(Value::as_str).filter(|s| !s.is_empty()) {
                parts.push(format!("STDERR: {}", stderr));
            }
            if let Some(code) = map.get("exit_code") {
                parts.push(format!("Exit code: {}", code));
            }
            parts.join("\n")
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_command_output() {
        let text = render_payload(&json!({"stdout": "v1.2\n", "stderr": "", "exit_code": 0}));
        assert_eq!(text, "v1.2\n\nExit code: 0");
    }

    #[test]
    fn test_render_plain_payloads() {
        assert_eq!(render_payload(&Value::Null), "ok");
        assert_eq!(render_payload(&json!("https://example.com")), "https://example.com");
        assert_eq!(render_payload(&json!({"installed": true})), "{\"installed\":true}");
    }
}
