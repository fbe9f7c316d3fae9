//! Agent loop scenarios against deterministic fakes
//!
//! The command target and decision source are in-process fakes, so every
//! scenario runs without a controller connection or a model server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use sencha::agent::context::{ContextWindow, Observation, StepRecord};
use sencha::agent::{AgentController, NullSink, SessionOutcome, StepSink, TerminationReason};
use sencha::backend::{BackendError, Decision, DecisionError, DecisionSource};
use sencha::config::AgentConfig;
use sencha::controller::{CommandTarget, DispatchError};
use sencha::protocol::{ActionType, Parameters};
use sencha::retry::RetryPolicy;

fn screenshot_payload() -> Value {
    json!({"image_base64": "iVBORw0KGgo=", "width": 1280, "height": 800, "format": "png"})
}

fn click(x: i64, y: i64) -> Decision {
    Decision::ToolCall {
        name: "click".to_string(),
        arguments: json!({"x": x, "y": y}),
    }
}

fn done(success: bool, reason: &str) -> Decision {
    Decision::Completion {
        success,
        reason: reason.to_string(),
    }
}

fn config(max_steps: u32) -> AgentConfig {
    AgentConfig {
        max_steps,
        retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        },
        session_deadline: None,
        ..AgentConfig::default()
    }
}

type Responder = dyn Fn(ActionType, usize) -> Result<Value, DispatchError> + Send + Sync;

/// Target that answers from a closure of (action, nth call of that action)
struct FakeTarget {
    calls: Mutex<Vec<ActionType>>,
    respond: Box<Responder>,
}

impl FakeTarget {
    fn new(respond: impl Fn(ActionType, usize) -> Result<Value, DispatchError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    /// Screenshots succeed, everything else returns `{"ok": true}`
    fn healthy() -> Arc<Self> {
        Self::new(|action, _| match action {
            ActionType::Screenshot => Ok(screenshot_payload()),
            _ => Ok(json!({"ok": true})),
        })
    }

    fn calls(&self) -> Vec<ActionType> {
        self.calls.lock().clone()
    }

    fn count(&self, action: ActionType) -> usize {
        self.calls.lock().iter().filter(|a| **a == action).count()
    }
}

#[async_trait]
impl CommandTarget for FakeTarget {
    fn agent_id(&self) -> &str {
        "fake-desk"
    }

    async fn execute(
        &self,
        action: ActionType,
        _parameters: Parameters,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        let nth = {
            let mut calls = self.calls.lock();
            calls.push(action);
            calls.iter().filter(|a| **a == action).count()
        };
        (self.respond)(action, nth)
    }
}

/// Target whose non-screenshot actions never complete on their own
struct HangingTarget;

#[async_trait]
impl CommandTarget for HangingTarget {
    fn agent_id(&self) -> &str {
        "hanging-desk"
    }

    async fn execute(
        &self,
        action: ActionType,
        _parameters: Parameters,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, DispatchError> {
        if action == ActionType::Screenshot {
            return Ok(screenshot_payload());
        }
        cancel.cancelled().await;
        Err(DispatchError::Cancelled)
    }
}

/// Replays scripted decisions, then keeps clicking
struct ScriptedDecider {
    script: Mutex<VecDeque<Result<Decision, DecisionError>>>,
    window_sizes: Mutex<Vec<usize>>,
    calls: AtomicUsize,
}

impl ScriptedDecider {
    fn new(script: Vec<Result<Decision, DecisionError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            window_sizes: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn always_click() -> Arc<Self> {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl DecisionSource for ScriptedDecider {
    async fn decide(&self, context: &ContextWindow, _observation: &Observation) -> Result<Decision, DecisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.window_sizes.lock().push(context.len());
        self.script.lock().pop_front().unwrap_or_else(|| Ok(click(100, 200)))
    }
}

#[derive(Default)]
struct RecordingSink {
    steps: Mutex<Vec<(String, u32)>>,
    outcomes: Mutex<Vec<TerminationReason>>,
}

#[async_trait]
impl StepSink for RecordingSink {
    async fn record_step(&self, session_id: &str, record: &StepRecord) {
        self.steps.lock().push((session_id.to_string(), record.step));
    }

    async fn record_outcome(&self, outcome: &SessionOutcome) {
        self.outcomes.lock().push(outcome.reason);
    }
}

fn controller(
    target: Arc<dyn CommandTarget>,
    decider: Arc<dyn DecisionSource>,
    config: AgentConfig,
) -> AgentController {
    AgentController::new(target, decider, Arc::new(NullSink), config)
}

#[tokio::test]
async fn test_max_steps_fails_closed_after_third_action() {
    let target = FakeTarget::healthy();
    let decider = ScriptedDecider::always_click();
    let agent = controller(target.clone(), decider.clone(), config(3));

    let outcome = agent.run("keep clicking", &CancellationToken::new()).await;

    assert_eq!(outcome.reason, TerminationReason::MaxStepsExceeded);
    assert_eq!(outcome.steps, 3);
    assert_eq!(outcome.history.len(), 3);
    assert_eq!(decider.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        target.calls(),
        vec![
            ActionType::Screenshot,
            ActionType::Click,
            ActionType::Screenshot,
            ActionType::Click,
            ActionType::Screenshot,
            ActionType::Click,
        ]
    );
    assert!(outcome.history.iter().all(|record| record.outcome.ok));
}

#[tokio::test]
async fn test_completion_signal_ends_session() {
    let target = FakeTarget::healthy();
    let decider = ScriptedDecider::new(vec![Ok(click(5, 5)), Ok(done(true, "settings saved"))]);
    let agent = controller(target.clone(), decider, config(10));

    let outcome = agent.run("save settings", &CancellationToken::new()).await;

    assert_eq!(outcome.reason, TerminationReason::Success);
    assert_eq!(outcome.detail, "settings saved");
    assert_eq!(outcome.steps, 1);
    assert_eq!(target.count(ActionType::Screenshot), 2);
}

#[tokio::test]
async fn test_unsuccessful_finish_is_failure() {
    let agent = controller(
        FakeTarget::healthy(),
        ScriptedDecider::new(vec![Ok(done(false, "app is not installed"))]),
        config(10),
    );

    let outcome = agent.run("open the app", &CancellationToken::new()).await;
    assert_eq!(outcome.reason, TerminationReason::Failure);
    assert_eq!(outcome.detail, "app is not installed");
    assert_eq!(outcome.steps, 0);
}

#[tokio::test]
async fn test_decision_error_terminates_with_failure() {
    let decider = ScriptedDecider::new(vec![
        Ok(click(1, 1)),
        Err(DecisionError::Exhausted {
            attempts: 3,
            last: BackendError::Malformed("no tool call".to_string()),
        }),
    ]);
    let agent = controller(FakeTarget::healthy(), decider, config(10));

    let outcome = agent.run("task", &CancellationToken::new()).await;
    assert_eq!(outcome.reason, TerminationReason::Failure);
    assert!(outcome.detail.contains("decision failed"));
    assert_eq!(outcome.history.len(), 1, "partial history is kept");
}

#[tokio::test]
async fn test_bad_tool_call_is_fed_back_not_fatal() {
    let target = FakeTarget::healthy();
    let decider = ScriptedDecider::new(vec![
        Ok(Decision::ToolCall {
            name: "teleport".to_string(),
            arguments: json!({}),
        }),
        Ok(Decision::ToolCall {
            name: "click".to_string(),
            arguments: json!({"x": 10}),
        }),
        Ok(done(true, "done")),
    ]);
    let agent = controller(target.clone(), decider, config(10));

    let outcome = agent.run("task", &CancellationToken::new()).await;

    assert_eq!(outcome.reason, TerminationReason::Success);
    assert_eq!(outcome.steps, 2);
    assert!(!outcome.history[0].outcome.ok);
    assert!(outcome.history[0].outcome.output.contains("unknown tool"));
    assert!(!outcome.history[1].outcome.ok);
    assert_eq!(target.count(ActionType::Click), 0, "invalid commands are never dispatched");
}

#[tokio::test]
async fn test_remote_rejection_is_fed_back_without_retry() {
    let target = FakeTarget::new(|action, _| match action {
        ActionType::Screenshot => Ok(screenshot_payload()),
        action => Err(DispatchError::Rejected {
            agent_id: "fake-desk".to_string(),
            action,
            detail: "invalid parameters: unknown mouse button 'double'".to_string(),
        }),
    });
    let decider = ScriptedDecider::new(vec![Ok(click(4, 4)), Ok(done(true, "used keyboard instead"))]);
    let agent = controller(target.clone(), decider, config(10));

    let outcome = agent.run("task", &CancellationToken::new()).await;

    assert_eq!(outcome.reason, TerminationReason::Success);
    assert_eq!(outcome.steps, 1);
    assert!(!outcome.history[0].outcome.ok);
    assert!(outcome.history[0].outcome.output.contains("unknown mouse button"));
    assert_eq!(target.count(ActionType::Click), 1, "rejections are not retried");
}

#[tokio::test]
async fn test_exhausted_remote_errors_fail_session_with_partial_history() {
    let target = FakeTarget::new(|action, _| match action {
        ActionType::Screenshot => Ok(screenshot_payload()),
        action => Err(DispatchError::RemoteExecution {
            agent_id: "fake-desk".to_string(),
            action,
            detail: "xdotool: no display".to_string(),
        }),
    });
    let agent = controller(target.clone(), ScriptedDecider::always_click(), config(10));

    let outcome = agent.run("task", &CancellationToken::new()).await;

    assert_eq!(outcome.reason, TerminationReason::Failure);
    assert!(outcome.detail.contains("no display"));
    assert_eq!(outcome.steps, 1);
    assert!(!outcome.history[0].outcome.ok);
    assert_eq!(target.count(ActionType::Click), 2, "retried up to max_attempts");
}

#[tokio::test]
async fn test_observation_retries_transient_timeout() {
    let target = FakeTarget::new(|action, nth| match (action, nth) {
        (ActionType::Screenshot, 1) => Err(DispatchError::Timeout {
            agent_id: "fake-desk".to_string(),
            action,
            timeout: Duration::from_secs(1),
        }),
        (ActionType::Screenshot, _) => Ok(screenshot_payload()),
        _ => Ok(Value::Null),
    });
    let agent = controller(target.clone(), ScriptedDecider::new(vec![Ok(done(true, "ok"))]), config(5));

    let outcome = agent.run("task", &CancellationToken::new()).await;
    assert_eq!(outcome.reason, TerminationReason::Success);
    assert_eq!(target.count(ActionType::Screenshot), 2);
}

#[tokio::test]
async fn test_observation_failure_after_retries() {
    let target = FakeTarget::new(|_, _| {
        Err(DispatchError::ChannelNotFound {
            agent_id: "fake-desk".to_string(),
        })
    });
    let decider = ScriptedDecider::always_click();
    let agent = controller(target.clone(), decider.clone(), config(5));

    let outcome = agent.run("task", &CancellationToken::new()).await;
    assert_eq!(outcome.reason, TerminationReason::Failure);
    assert_eq!(target.count(ActionType::Screenshot), 2);
    assert_eq!(decider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancellation_returns_promptly() {
    let agent = controller(Arc::new(HangingTarget), ScriptedDecider::always_click(), config(10));
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    let outcome = tokio::time::timeout(Duration::from_secs(2), agent.run("task", &cancel))
        .await
        .expect("session must stop promptly after cancellation");
    canceller.await.unwrap();

    assert_eq!(outcome.reason, TerminationReason::Cancelled);
    assert_eq!(outcome.steps, 0);
}

#[tokio::test(start_paused = true)]
async fn test_session_deadline_is_failure() {
    let agent = controller(
        Arc::new(HangingTarget),
        ScriptedDecider::always_click(),
        AgentConfig {
            session_deadline: Some(Duration::from_secs(5)),
            ..config(10)
        },
    );

    let outcome = agent.run("task", &CancellationToken::new()).await;
    assert_eq!(outcome.reason, TerminationReason::Failure);
    assert!(outcome.detail.contains("deadline"));
}

#[tokio::test]
async fn test_context_window_never_exceeds_capacity() {
    let decider = ScriptedDecider::always_click();
    let agent = controller(
        FakeTarget::healthy(),
        decider.clone(),
        AgentConfig {
            context_capacity: 2,
            ..config(6)
        },
    );

    let outcome = agent.run("task", &CancellationToken::new()).await;
    assert_eq!(outcome.reason, TerminationReason::MaxStepsExceeded);
    assert_eq!(outcome.history.len(), 6, "full history is kept outside the window");

    let sizes = decider.window_sizes.lock().clone();
    assert_eq!(sizes, vec![0, 1, 2, 2, 2, 2]);
}

#[tokio::test]
async fn test_sink_sees_every_step_and_outcome() {
    let sink = Arc::new(RecordingSink::default());
    let agent = AgentController::new(
        FakeTarget::healthy(),
        ScriptedDecider::new(vec![Ok(click(1, 2)), Ok(click(3, 4)), Ok(done(true, "ok"))]),
        sink.clone(),
        config(10),
    );

    let outcome = agent
        .run_session("session-42".to_string(), "task", &CancellationToken::new())
        .await;

    assert_eq!(outcome.session_id, "session-42");
    assert_eq!(
        *sink.steps.lock(),
        vec![("session-42".to_string(), 1), ("session-42".to_string(), 2)]
    );
    assert_eq!(*sink.outcomes.lock(), vec![TerminationReason::Success]);
}
