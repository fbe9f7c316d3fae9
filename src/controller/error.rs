//! Error types for the dispatcher and pending-request registry

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{ActionType, ProtocolError};

/// Why a dispatch did not produce a payload
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// No live channel for the target machine
    #[error("no live controller channel for agent '{agent_id}'")]
    ChannelNotFound { agent_id: String },

    /// The remote side did not reply in time (or reported a timeout)
    #[error("{action} on agent '{agent_id}' timed out after {timeout:?}")]
    Timeout {
        agent_id: String,
        action: ActionType,
        timeout: Duration,
    },

    /// The remote side replied with an explicit failure
    #[error("{action} failed on agent '{agent_id}': {detail}")]
    RemoteExecution {
        agent_id: String,
        action: ActionType,
        detail: String,
    },

    /// The remote side refused the command as given (bad arguments, an
    /// action it cannot perform); resending it unchanged fails the same way
    #[error("{action} rejected by agent '{agent_id}': {detail}")]
    Rejected {
        agent_id: String,
        action: ActionType,
        detail: String,
    },

    /// The caller's session was cancelled while the command was pending
    #[error("session cancelled")]
    Cancelled,

    /// The command failed local validation and was never sent
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl DispatchError {
    /// Whether the agent loop may retry the same command
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::ChannelNotFound { .. }
                | DispatchError::Timeout { .. }
                | DispatchError::RemoteExecution { .. }
        )
    }

    /// Label used for the `outcome` dimension of dispatch metrics
    pub fn outcome(&self) -> &'static str {
        match self {
            DispatchError::ChannelNotFound { .. } => "channel_not_found",
            DispatchError::Timeout { .. } => "timeout",
            DispatchError::RemoteExecution { .. } => "remote_error",
            DispatchError::Rejected { .. } => "rejected",
            DispatchError::Cancelled => "cancelled",
            DispatchError::InvalidCommand(_) => "invalid",
        }
    }
}

impl From<ProtocolError> for DispatchError {
    fn from(e: ProtocolError) -> Self {
        DispatchError::InvalidCommand(e.to_string())
    }
}

/// Errors from the pending-request registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("correlation id '{0}' already has a pending waiter")]
    Duplicate(String),

    #[error("registry closed: {0}")]
    Closed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DispatchError::ChannelNotFound { agent_id: "m1".into() }.is_retryable());
        assert!(DispatchError::Timeout {
            agent_id: "m1".into(),
            action: ActionType::Screenshot,
            timeout: Duration::from_secs(5),
        }
        .is_retryable());
        assert!(!DispatchError::Cancelled.is_retryable());
        assert!(!DispatchError::InvalidCommand("x".into()).is_retryable());
        assert!(!DispatchError::Rejected {
            agent_id: "m1".into(),
            action: ActionType::Scroll,
            detail: "unknown scroll direction 'sideways'".into(),
        }
        .is_retryable());
    }
}
