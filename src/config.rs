//! Typed configuration for the server, agent loop, backends and executor client
//!
//! Binaries fill these from `clap` flags (with `SENCHA_*` environment
//! fallbacks) and call `validate()` before starting anything.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendKind;
use crate::controller::ChannelSettings;
use crate::retry::RetryPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn validate_retry(field: &'static str, retry: &RetryPolicy) -> Result<(), ConfigError> {
    if retry.max_attempts == 0 {
        return Err(invalid(field, "max_attempts must be at least 1"));
    }
    if retry.multiplier < 1.0 {
        return Err(invalid(field, "multiplier must be >= 1.0"));
    }
    if retry.initial_backoff > retry.max_backoff {
        return Err(invalid(field, "initial backoff exceeds max backoff"));
    }
    Ok(())
}

/// Parse `key=machine_id` pairs separated by commas
pub fn parse_api_keys(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, machine)) if !key.trim().is_empty() && !machine.trim().is_empty() => {
                Ok((key.trim().to_string(), machine.trim().to_string()))
            }
            _ => Err(invalid("api_keys", format!("expected key=machine_id, got '{}'", pair))),
        })
        .collect()
}

/// Controller server settings
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub bind_addr: SocketAddr,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Connections silent for longer than this are closed
    pub heartbeat_timeout: Duration,
    /// Default timeout for one-off dispatches
    pub command_timeout: Duration,
    pub outbound_buffer: usize,
    /// API key → machine id
    pub api_keys: HashMap<String, String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            command_timeout: Duration::from_secs(30),
            outbound_buffer: 64,
            api_keys: HashMap::new(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake_timeout.is_zero() {
            return Err(invalid("handshake_timeout", "must be positive"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat_interval", "must be positive"));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(invalid(
                "heartbeat_timeout",
                "must be longer than the heartbeat interval",
            ));
        }
        if self.command_timeout.is_zero() {
            return Err(invalid("command_timeout", "must be positive"));
        }
        if self.outbound_buffer == 0 {
            return Err(invalid("outbound_buffer", "must be at least 1"));
        }
        Ok(())
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            handshake_timeout: self.handshake_timeout,
            heartbeat_interval: self.heartbeat_interval,
            outbound_buffer: self.outbound_buffer,
        }
    }
}

/// Agent loop settings
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// ACTING phases allowed before the session fails closed
    pub max_steps: u32,
    /// Step records kept verbatim in the context window
    pub context_capacity: usize,
    /// Character cap of the folded summary of evicted steps
    pub summary_chars: usize,
    /// Character cap of a single action output in the window
    pub output_chars: usize,
    pub observe_timeout: Duration,
    pub action_timeout: Duration,
    /// Retry policy for observation and action dispatches
    pub retry: RetryPolicy,
    /// Whole-session deadline
    pub session_deadline: Option<Duration>,
    /// Also request structured page elements while observing
    pub observe_elements: bool,
    pub system_prompt: Option<String>,
    /// Where session JSON files go (none = not persisted)
    pub session_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 30,
            context_capacity: 8,
            summary_chars: 4000,
            output_chars: 2000,
            observe_timeout: Duration::from_secs(30),
            action_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            session_deadline: Some(Duration::from_secs(300)),
            observe_elements: false,
            system_prompt: None,
            session_dir: None,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_steps == 0 {
            return Err(invalid("max_steps", "must be at least 1"));
        }
        if self.context_capacity == 0 {
            return Err(invalid("context_capacity", "must be at least 1"));
        }
        if self.output_chars < 16 {
            return Err(invalid("output_chars", "must be at least 16"));
        }
        if self.observe_timeout.is_zero() || self.action_timeout.is_zero() {
            return Err(invalid("timeouts", "observe and action timeouts must be positive"));
        }
        if self.session_deadline.is_some_and(|d| d.is_zero()) {
            return Err(invalid("session_deadline", "must be positive when set"));
        }
        validate_retry("agent retry", &self.retry)
    }
}

/// Reasoning backend settings
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub local_url: String,
    /// Base url of the hosted API, including the version segment
    pub hosted_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Check that the local model exists before serving
    pub check_model: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Local,
            local_url: "http://localhost:11434".to_string(),
            hosted_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "qwen2.5vl".to_string(),
            temperature: 0.1,
            max_tokens: 4096,
            request_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
            check_model: true,
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(invalid("model", "must not be empty"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(invalid("temperature", "must be within 0.0..=2.0"));
        }
        if self.max_tokens == 0 {
            return Err(invalid("max_tokens", "must be at least 1"));
        }
        let url = match self.kind {
            BackendKind::Local => &self.local_url,
            BackendKind::Hosted => &self.hosted_url,
        };
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(invalid("backend url", format!("'{}' is not an http(s) url", url)));
        }
        validate_retry("backend retry", &self.retry)
    }
}

/// Remote executor client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `ws://server:8080/ws/controller`
    pub server_url: String,
    pub api_key: String,
    pub reconnect_interval: Duration,
    /// Consecutive failed connection attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Upper bound for a single `run_command`
    pub command_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080/ws/controller".to_string(),
            api_key: String::new(),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            command_timeout: Duration::from_secs(120),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(invalid("server_url", "must start with ws:// or wss://"));
        }
        if self.api_key.is_empty() {
            return Err(invalid("api_key", "must not be empty"));
        }
        if self.command_timeout.is_zero() {
            return Err(invalid("command_timeout", "must be positive"));
        }
        Ok(())
    }
}
