//! Typed frames and envelopes for the controller channel

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Named command arguments, kept in insertion order on the wire
pub type Parameters = serde_json::Map<String, Value>;

/// Errors raised while encoding, decoding or validating protocol messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown action type: {0}")]
    UnknownAction(String),

    #[error("missing parameter '{param}' for {action}")]
    MissingParameter { action: ActionType, param: &'static str },

    #[error("parameter '{param}' for {action} must be {expected}")]
    InvalidParameter {
        action: ActionType,
        param: &'static str,
        expected: &'static str,
    },

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

/// Every action the remote controller knows how to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Click,
    Hover,
    Drag,
    TypeText,
    KeyPress,
    Scroll,
    Wait,
    Screenshot,
    RunCommand,
    BrowserNavigate,
    BrowserClick,
    BrowserType,
    BrowserHover,
    BrowserGetElements,
    BrowserGetPageContent,
    BrowserGetUrl,
    BrowserTakeScreenshot,
    LaunchApp,
    CheckAppInstalled,
}

/// Expected JSON type of a command parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Integer,
    Number,
    Text,
}

impl ParamKind {
    fn describe(self) -> &'static str {
        match self {
            ParamKind::Integer => "an integer",
            ParamKind::Number => "a number",
            ParamKind::Text => "a string",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Text => value.is_string(),
        }
    }
}

impl ActionType {
    pub const ALL: [ActionType; 19] = [
        ActionType::Click,
        ActionType::Hover,
        ActionType::Drag,
        ActionType::TypeText,
        ActionType::KeyPress,
        ActionType::Scroll,
        ActionType::Wait,
        ActionType::Screenshot,
        ActionType::RunCommand,
        ActionType::BrowserNavigate,
        ActionType::BrowserClick,
        ActionType::BrowserType,
        ActionType::BrowserHover,
        ActionType::BrowserGetElements,
        ActionType::BrowserGetPageContent,
        ActionType::BrowserGetUrl,
        ActionType::BrowserTakeScreenshot,
        ActionType::LaunchApp,
        ActionType::CheckAppInstalled,
    ];

    /// Wire name of the action (`type_text`, `browser_navigate`, ...)
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Click => "click",
            ActionType::Hover => "hover",
            ActionType::Drag => "drag",
            ActionType::TypeText => "type_text",
            ActionType::KeyPress => "key_press",
            ActionType::Scroll => "scroll",
            ActionType::Wait => "wait",
            ActionType::Screenshot => "screenshot",
            ActionType::RunCommand => "run_command",
            ActionType::BrowserNavigate => "browser_navigate",
            ActionType::BrowserClick => "browser_click",
            ActionType::BrowserType => "browser_type",
            ActionType::BrowserHover => "browser_hover",
            ActionType::BrowserGetElements => "browser_get_elements",
            ActionType::BrowserGetPageContent => "browser_get_page_content",
            ActionType::BrowserGetUrl => "browser_get_url",
            ActionType::BrowserTakeScreenshot => "browser_take_screenshot",
            ActionType::LaunchApp => "launch_app",
            ActionType::CheckAppInstalled => "check_app_installed",
        }
    }

    /// Parameters that must be present (with the given type) for this action
    pub fn required_params(self) -> &'static [(&'static str, ParamKind)] {
        use ParamKind::*;
        match self {
            ActionType::Click | ActionType::Hover => &[("x", Integer), ("y", Integer)],
            ActionType::Drag => &[
                ("start_x", Integer),
                ("start_y", Integer),
                ("end_x", Integer),
                ("end_y", Integer),
            ],
            ActionType::TypeText => &[("text", Text)],
            ActionType::KeyPress => &[("keys", Text)],
            ActionType::Scroll => &[("direction", Text)],
            ActionType::Wait => &[("seconds", Number)],
            ActionType::RunCommand => &[("command", Text)],
            ActionType::BrowserNavigate => &[("url", Text)],
            ActionType::BrowserClick | ActionType::BrowserHover => {
                &[("element_index", Integer)]
            }
            ActionType::BrowserType => &[("element_index", Integer), ("text", Text)],
            ActionType::LaunchApp | ActionType::CheckAppInstalled => &[("app_name", Text)],
            ActionType::Screenshot
            | ActionType::BrowserGetElements
            | ActionType::BrowserGetPageContent
            | ActionType::BrowserGetUrl
            | ActionType::BrowserTakeScreenshot => &[],
        }
    }

    /// Check that `params` carries every required argument with the right type
    pub fn validate(self, params: &Parameters) -> Result<(), ProtocolError> {
        for &(param, kind) in self.required_params() {
            match params.get(param) {
                None | Some(Value::Null) => {
                    return Err(ProtocolError::MissingParameter { action: self, param })
                }
                Some(value) if !kind.matches(value) => {
                    return Err(ProtocolError::InvalidParameter {
                        action: self,
                        param,
                        expected: kind.describe(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Whether the action returns a screenshot payload
    pub fn returns_screenshot(self) -> bool {
        matches!(self, ActionType::Screenshot | ActionType::BrowserTakeScreenshot)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownAction(s.to_string()))
    }
}

/// A command sent from the server to a remote controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub correlation_id: String,
    pub action: ActionType,
    #[serde(default)]
    pub parameters: Parameters,
    pub issued_at: DateTime<Utc>,
}

impl CommandEnvelope {
    /// Build a command with a fresh time-sortable correlation id
    pub fn new(action: ActionType, parameters: Parameters) -> Self {
        Self::with_id(Uuid::now_v7().to_string(), action, parameters)
    }

    pub fn with_id(correlation_id: impl Into<String>, action: ActionType, parameters: Parameters) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            action,
            parameters,
            issued_at: Utc::now(),
        }
    }
}

/// Outcome reported by the remote controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Ok,
    Error,
    Timeout,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Ok => "ok",
            ResultStatus::Error => "error",
            ResultStatus::Timeout => "timeout",
        }
    }
}

/// A reply correlated to exactly one command
///
/// `error_detail` is present iff `status` is `Error`. Use the constructors or
/// [`ResultEnvelope::normalize`] on inbound frames to keep that true.
/// `error_code` optionally classifies an error; see [`ErrorCode::is_rejection`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub correlation_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl ResultEnvelope {
    pub fn ok(correlation_id: impl Into<String>, payload: Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResultStatus::Ok,
            payload,
            error_detail: None,
            error_code: None,
        }
    }

    pub fn error(correlation_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResultStatus::Error,
            payload: Value::Null,
            error_detail: Some(detail.into()),
            error_code: None,
        }
    }

    /// An error classified by `code`; rejection codes mean the command itself
    /// is at fault and resending it unchanged cannot help
    pub fn coded_error(correlation_id: impl Into<String>, code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            error_code: Some(code),
            ..Self::error(correlation_id, detail)
        }
    }

    pub fn timeout(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResultStatus::Timeout,
            payload: Value::Null,
            error_detail: None,
            error_code: None,
        }
    }

    /// Enforce the `error_detail` iff `Error` rule on a frame from the wire
    pub fn normalize(mut self) -> Self {
        match self.status {
            ResultStatus::Error => {
                if self.error_detail.as_deref().map_or(true, str::is_empty) {
                    self.error_detail = Some("remote reported an unspecified error".to_string());
                }
            }
            ResultStatus::Ok | ResultStatus::Timeout => {
                self.error_detail = None;
                self.error_code = None;
            }
        }
        self
    }

    /// Whether this is an error the remote side classified as a rejection
    pub fn is_rejection(&self) -> bool {
        self.status == ResultStatus::Error && self.error_code.is_some_and(ErrorCode::is_rejection)
    }
}

/// Screenshot payload returned by `screenshot` / `browser_take_screenshot`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    pub image_base64: String,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_image_format")]
    pub format: String,
}

fn default_image_format() -> String {
    "png".to_string()
}

impl Screenshot {
    pub fn from_payload(payload: &Value) -> Result<Self, ProtocolError> {
        let screenshot: Screenshot =
            serde_json::from_value(payload.clone()).map_err(|e| ProtocolError::InvalidPayload {
                kind: "screenshot",
                reason: e.to_string(),
            })?;
        if screenshot.image_base64.is_empty() {
            return Err(ProtocolError::InvalidPayload {
                kind: "screenshot",
                reason: "empty image data".to_string(),
            });
        }
        Ok(screenshot)
    }

    pub fn media_type(&self) -> String {
        format!("image/{}", self.format)
    }
}

/// Handshake verdict sent back to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Error,
}

/// Error codes carried by `error` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotAuthenticated,
    InvalidMessage,
    UnknownCommand,
    ExecutionFailed,
    /// Arguments the executor could not act on
    InvalidParameters,
    /// Action the executor cannot perform on this machine
    Unsupported,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotAuthenticated => "not_authenticated",
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::UnknownCommand => "unknown_command",
            ErrorCode::ExecutionFailed => "execution_failed",
            ErrorCode::InvalidParameters => "invalid_parameters",
            ErrorCode::Unsupported => "unsupported",
        }
    }

    /// Errors that fail the same way however often the command is resent
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            ErrorCode::UnknownCommand | ErrorCode::InvalidParameters | ErrorCode::Unsupported
        )
    }
}

/// One frame on the controller channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Handshake {
        #[serde(default)]
        request_id: String,
        api_key: String,
        #[serde(default)]
        client_version: String,
        #[serde(default)]
        system_info: serde_json::Map<String, Value>,
    },
    HandshakeAck {
        #[serde(default)]
        request_id: String,
        status: AckStatus,
        #[serde(default)]
        message: String,
        #[serde(default)]
        machine_id: String,
    },
    Command(CommandEnvelope),
    Result(ResultEnvelope),
    Ping {
        #[serde(default)]
        request_id: String,
    },
    Pong {
        #[serde(default)]
        request_id: String,
    },
    Error {
        #[serde(default)]
        request_id: String,
        code: ErrorCode,
        #[serde(default)]
        message: String,
    },
}

impl Frame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn ping() -> Self {
        Frame::Ping {
            request_id: Uuid::now_v7().to_string(),
        }
    }

    pub fn error(request_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::Error {
            request_id: request_id.into(),
            code,
            message: message.into(),
        }
    }

    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Handshake { .. } => "handshake",
            Frame::HandshakeAck { .. } => "handshake_ack",
            Frame::Command(_) => "command",
            Frame::Result(_) => "result",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_action_wire_names_match_serde() {
        for action in ActionType::ALL {
            let encoded = serde_json::to_value(action).unwrap();
            assert_eq!(encoded, Value::String(action.as_str().to_string()));
            assert_eq!(action.as_str().parse::<ActionType>().unwrap(), action);
        }
    }

    #[test]
    fn test_unknown_action_rejected() {
        assert!(matches!(
            "teleport".parse::<ActionType>(),
            Err(ProtocolError::UnknownAction(_))
        ));
    }

    #[test]
    fn test_validate_click_parameters() {
        assert!(ActionType::Click
            .validate(&params(json!({"x": 10, "y": 20})))
            .is_ok());
        assert!(matches!(
            ActionType::Click.validate(&params(json!({"x": 10}))),
            Err(ProtocolError::MissingParameter { param: "y", .. })
        ));
        assert!(matches!(
            ActionType::Click.validate(&params(json!({"x": "10", "y": 20}))),
            Err(ProtocolError::InvalidParameter { param: "x", .. })
        ));
    }

    #[test]
    fn test_screenshot_needs_no_parameters() {
        assert!(ActionType::Screenshot.validate(&Parameters::new()).is_ok());
    }

    #[test]
    fn test_command_frame_carries_type_discriminator() {
        let mut parameters = Parameters::new();
        parameters.insert("url".to_string(), json!("https://example.com"));
        let frame = Frame::Command(CommandEnvelope::with_id(
            "abc",
            ActionType::BrowserNavigate,
            parameters,
        ));

        let text = frame.encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["action"], "browser_navigate");
        assert_eq!(value["correlation_id"], "abc");
        assert_eq!(Frame::decode(&text).unwrap(), frame);
    }

    #[test]
    fn test_parameters_keep_insertion_order() {
        let mut parameters = Parameters::new();
        parameters.insert("y".to_string(), json!(2));
        parameters.insert("x".to_string(), json!(1));
        let envelope = CommandEnvelope::with_id("id", ActionType::Click, parameters);
        let text = serde_json::to_string(&envelope).unwrap();
        assert!(text.find("\"y\"").unwrap() < text.find("\"x\"").unwrap());
    }

    #[test]
    fn test_result_frame_from_controller() {
        let text = r#"{"type":"result","correlation_id":"c1","status":"error","error_detail":"no such window"}"#;
        match Frame::decode(text).unwrap() {
            Frame::Result(result) => {
                assert_eq!(result.status, ResultStatus::Error);
                assert_eq!(result.error_detail.as_deref(), Some("no such window"));
                assert_eq!(result.payload, Value::Null);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_unknown_frame_type_is_malformed() {
        assert!(matches!(
            Frame::decode(r#"{"type":"bogus"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(Frame::decode("not json").is_err());
    }

    #[test]
    fn test_normalize_enforces_error_detail_rule() {
        let bare_error = ResultEnvelope {
            correlation_id: "c".to_string(),
            status: ResultStatus::Error,
            payload: Value::Null,
            error_detail: None,
            error_code: None,
        };
        assert!(bare_error.normalize().error_detail.is_some());

        let ok_with_detail = ResultEnvelope {
            correlation_id: "c".to_string(),
            status: ResultStatus::Ok,
            payload: json!(true),
            error_detail: Some("stray".to_string()),
            error_code: Some(ErrorCode::Unsupported),
        };
        let normalized = ok_with_detail.normalize();
        assert!(normalized.error_detail.is_none());
        assert!(normalized.error_code.is_none());
    }

    #[test]
    fn test_rejection_code_on_the_wire() {
        let text = r#"{"type":"result","correlation_id":"c2","status":"error","error_detail":"unknown mouse button 'double'","error_code":"invalid_parameters"}"#;
        match Frame::decode(text).unwrap() {
            Frame::Result(result) => {
                assert_eq!(result.error_code, Some(ErrorCode::InvalidParameters));
                assert!(result.is_rejection());
            }
            other => panic!("unexpected frame {:?}", other),
        }

        let failed = ResultEnvelope::coded_error("c3", ErrorCode::ExecutionFailed, "xdotool exited 1");
        assert!(!failed.is_rejection());
        assert!(!ResultEnvelope::error("c4", "boom").is_rejection());
    }

    #[test]
    fn test_screenshot_payload() {
        let payload = json!({"image_base64": "iVBORw0", "width": 1280, "height": 800});
        let shot = Screenshot::from_payload(&payload).unwrap();
        assert_eq!(shot.width, 1280);
        assert_eq!(shot.format, "png");
        assert_eq!(shot.media_type(), "image/png");

        assert!(Screenshot::from_payload(&json!({"image_base64": "", "width": 1, "height": 1})).is_err());
        assert!(Screenshot::from_payload(&json!(true)).is_err());
    }
}
