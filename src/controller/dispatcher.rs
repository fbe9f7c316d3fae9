//! Controller dispatcher
//!
//! `dispatch` sends one command to one agent and suspends until the correlated
//! reply arrives, the timeout elapses, or the caller's token is cancelled.
//! Timeout and cancellation both expire the pending entry, so a reply that
//! shows up afterwards is dropped by the registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use super::channel::ChannelRegistry;
use super::error::{DispatchError, RegistryError};
use crate::metrics::{DISPATCHES, DISPATCH_DURATION};
use crate::protocol::{ActionType, CommandEnvelope, Frame, Parameters, ResultStatus};

pub struct Dispatcher {
    channels: Arc<ChannelRegistry>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(channels: Arc<ChannelRegistry>, default_timeout: Duration) -> Self {
        Self {
            channels,
            default_timeout,
        }
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Send `action` to `agent_id` and wait for its payload
    pub async fn dispatch(
        &self,
        agent_id: &str,
        action: ActionType,
        parameters: Parameters,
        timeout: Option<Duration>,
    ) -> Result<Value, DispatchError> {
        self.dispatch_cancellable(agent_id, action, parameters, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`Dispatcher::dispatch`], returning `Cancelled` as soon as `cancel` fires
    pub async fn dispatch_cancellable(
        &self,
        agent_id: &str,
        action: ActionType,
        parameters: Parameters,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Value, DispatchError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let command = CommandEnvelope::new(action, parameters);
        let span = info_span!(
            "dispatch",
            agent_id,
            action = %action,
            correlation_id = %command.correlation_id,
        );

        let started = Instant::now();
        let result = self
            .dispatch_inner(agent_id, command, timeout, cancel)
            .instrument(span)
            .await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.outcome(),
        };
        DISPATCHES.with_label_values(&[action.as_str(), outcome]).inc();
        DISPATCH_DURATION
            .with_label_values(&[action.as_str()])
            .observe(started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch_inner(
        &self,
        agent_id: &str,
        command: CommandEnvelope,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        let action = command.action;
        action.validate(&command.parameters)?;

        let conn = self
            .channels
            .get(agent_id)
            .ok_or_else(|| DispatchError::ChannelNotFound {
                agent_id: agent_id.to_string(),
            })?;

        let correlation_id = command.correlation_id.clone();
        let reply = conn.pending().register(&correlation_id).map_err(|e| match e {
            RegistryError::Closed(_) => DispatchError::ChannelNotFound {
                agent_id: agent_id.to_string(),
            },
            RegistryError::Duplicate(_) => DispatchError::InvalidCommand(e.to_string()),
        })?;
        let _busy = conn.begin_command();

        // Registered before sending so a fast reply cannot miss its waiter.
        // The send shares the deadline and the cancellation race with the
        // wait: a full outbound queue must not outlive either.
        let exchange = async {
            conn.send(Frame::Command(command)).await?;
            tracing::debug!("command sent");
            Ok::<_, DispatchError>(reply.wait().await)
        };

        // Every early return drops `reply`, which expires the entry
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("dispatch cancelled");
                return Err(DispatchError::Cancelled);
            }
            exchanged = tokio::time::timeout(timeout, exchange) => match exchanged {
                Ok(Ok(Some(result))) => result,
                Ok(Ok(None)) => {
                    return Err(DispatchError::RemoteExecution {
                        agent_id: agent_id.to_string(),
                        action,
                        detail: "reply channel dropped".to_string(),
                    })
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::warn!(timeout_ms = timeout.as_millis() as u64, "command timed out");
                    return Err(DispatchError::Timeout {
                        agent_id: agent_id.to_string(),
                        action,
                        timeout,
                    });
                }
            },
        };

        match result.status {
            ResultStatus::Ok => Ok(result.payload),
            ResultStatus::Error if result.is_rejection() => Err(DispatchError::Rejected {
                agent_id: agent_id.to_string(),
                action,
                detail: result.error_detail.unwrap_or_default(),
            }),
            ResultStatus::Error => Err(DispatchError::RemoteExecution {
                agent_id: agent_id.to_string(),
                action,
                detail: result.error_detail.unwrap_or_default(),
            }),
            ResultStatus::Timeout => Err(DispatchError::Timeout {
                agent_id: agent_id.to_string(),
                action,
                timeout,
            }),
        }
    }
}

/// Something that can execute a command on one particular machine
///
/// The agent loop only sees this trait, so tests can drive it with scripted
/// fakes instead of a live channel.
#[async_trait]
pub trait CommandTarget: Send + Sync {
    fn agent_id(&self) -> &str;

    async fn execute(
        &self,
        action: ActionType,
        parameters: Parameters,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, DispatchError>;
}

/// [`CommandTarget`] bound to one machine through the shared dispatcher
#[derive(Clone)]
pub struct AgentHandle {
    dispatcher: Arc<Dispatcher>,
    agent_id: String,
}

impl AgentHandle {
    pub fn new(dispatcher: Arc<Dispatcher>, agent_id: impl Into<String>) -> Self {
        Self {
            dispatcher,
            agent_id: agent_id.into(),
        }
    }
}

#[async_trait]
impl CommandTarget for AgentHandle {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn execute(
        &self,
        action: ActionType,
        parameters: Parameters,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, DispatchError> {
        self.dispatcher
            .dispatch_cancellable(&self.agent_id, action, parameters, Some(timeout), cancel)
            .await
    }
}
