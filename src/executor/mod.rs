//! Remote executor: the process on the target machine
//!
//! [`client::ControllerClient`] keeps the WebSocket to the server alive and
//! hands each command to an [`ActionExecutor`]. [`desktop::DesktopExecutor`]
//! is the shipped implementation for X11 desktops, with browser actions
//! served by [`browser::BrowserExecutor`] over the DevTools protocol.

pub mod browser;
pub mod client;
pub mod desktop;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::protocol::{ActionType, ErrorCode, Parameters};

pub use browser::{BrowserError, BrowserExecutor};
pub use client::{ClientError, ControllerClient};
pub use desktop::DesktopExecutor;

/// Version reported in the handshake
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{action} is not supported by this executor: {reason}")]
    Unsupported { action: ActionType, reason: &'static str },

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("failed to start '{tool}': {source}")]
    ToolMissing {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{tool}' failed: {detail}")]
    Failed { tool: String, detail: String },

    #[error("action timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Browser(#[from] BrowserError),
}

impl ExecutionError {
    /// Wire code for the failure result
    ///
    /// Bad parameters and missing capabilities fail the same way on every
    /// attempt, so they carry a rejection code the controller does not retry.
    pub fn code(&self) -> ErrorCode {
        match self {
            ExecutionError::InvalidParameters(_)
            | ExecutionError::Browser(BrowserError::ElementNotFound(_)) => ErrorCode::InvalidParameters,
            ExecutionError::Unsupported { .. } | ExecutionError::Browser(BrowserError::Unavailable { .. }) => {
                ErrorCode::Unsupported
            }
            _ => ErrorCode::ExecutionFailed,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ExecutionError::TimedOut(_) | ExecutionError::Browser(BrowserError::Timeout { .. })
        )
    }
}

/// Performs one action on the local machine
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: ActionType, parameters: &Parameters) -> Result<Value, ExecutionError>;
}

/// Host facts sent in the handshake
pub fn system_info() -> Map<String, Value> {
    let mut info = Map::new();
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    info.insert("hostname".to_string(), Value::String(hostname));
    info.insert("os".to_string(), Value::String(std::env::consts::OS.to_string()));
    info.insert("arch".to_string(), Value::String(std::env::consts::ARCH.to_string()));
    info.insert("client_version".to_string(), Value::String(CLIENT_VERSION.to_string()));
    if let Ok(display) = std::env::var("DISPLAY") {
        info.insert("display".to_string(), Value::String(display));
    }
    info
}

pub(crate) fn require_i64(parameters: &Parameters, key: &str) -> Result<i64, ExecutionError> {
    parameters
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| ExecutionError::InvalidParameters(format!("'{}' must be an integer", key)))
}

pub(crate) fn require_str<'a>(parameters: &'a Parameters, key: &str) -> Result<&'a str, ExecutionError> {
    parameters
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ExecutionError::InvalidParameters(format!("'{}' must be a string", key)))
}

/// Only web and local-file URLs may be opened
pub(crate) fn check_url(url: &str) -> Result<(), ExecutionError> {
    if ["http://", "https://", "file://"].iter().any(|scheme| url.starts_with(scheme)) {
        Ok(())
    } else {
        Err(ExecutionError::InvalidParameters(format!("unsupported url '{}'", url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_info_fields() {
        let info = system_info();
        assert_eq!(info["os"], Value::String(std::env::consts::OS.to_string()));
        assert_eq!(info["client_version"], Value::String(CLIENT_VERSION.to_string()));
        assert!(info.contains_key("hostname"));
    }

    #[test]
    fn test_error_codes() {
        let invalid = ExecutionError::InvalidParameters("'x' must be an integer".to_string());
        assert_eq!(invalid.code(), ErrorCode::InvalidParameters);

        let unsupported = ExecutionError::Unsupported {
            action: ActionType::BrowserClick,
            reason: "no browser",
        };
        assert_eq!(unsupported.code(), ErrorCode::Unsupported);

        let missing = ExecutionError::Browser(BrowserError::ElementNotFound(7));
        assert_eq!(missing.code(), ErrorCode::InvalidParameters);

        let failed = ExecutionError::Failed {
            tool: "xdotool".to_string(),
            detail: "exit code 1".to_string(),
        };
        assert_eq!(failed.code(), ErrorCode::ExecutionFailed);
        assert!(!failed.is_timeout());
        assert!(ExecutionError::TimedOut(Duration::from_secs(1)).is_timeout());
    }

    #[test]
    fn test_check_url_schemes() {
        assert!(check_url("https://example.com").is_ok());
        assert!(check_url("file:///tmp/report.html").is_ok());
        assert!(check_url("javascript:alert(1)").is_err());
    }
}
