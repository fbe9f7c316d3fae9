//! X11 desktop executor built on command-line tools
//!
//! Input goes through `xdotool`, screenshots through ImageMagick's `import`,
//! URLs and applications through `xdg-open` and `$PATH`. Every child process
//! runs with a null stdin and a bounded lifetime. The `browser_*` actions go to
//! an attached [`BrowserExecutor`] when one is configured.

use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::browser::BrowserExecutor;
use super::{check_url, require_i64, require_str, ActionExecutor, ExecutionError};
use crate::protocol::{ActionType, Parameters};

/// Timeout for input and screenshot tools; `run_command` uses its own
const TOOL_TIMEOUT: Duration = Duration::from_secs(15);

const BROWSER_DRIVER_REQUIRED: &str = "no browser is attached to this executor";

pub struct DesktopExecutor {
    command_timeout: Duration,
    type_delay_ms: u32,
    browser: Option<BrowserExecutor>,
}

impl DesktopExecutor {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            command_timeout,
            type_delay_ms: 12,
            browser: None,
        }
    }

    /// Route `browser_*` actions to a DevTools-driven browser
    pub fn with_browser(mut self, browser: BrowserExecutor) -> Self {
        self.browser = Some(browser);
        self
    }

    async fn xdotool(&self, args: &[String]) -> Result<(), ExecutionError> {
        let output = run_tool("xdotool", args, TOOL_TIMEOUT).await?;
        check_status("xdotool", &output)
    }

    async fn click(&self, parameters: &Parameters) -> Result<Value, ExecutionError> {
        let x = require_i64(parameters, "x")?;
        let y = require_i64(parameters, "y")?;
        let button = match parameters.get("button").and_then(Value::as_str).unwrap_or("left") {
            "left" => "1",
            "middle" => "2",
            "right" => "3",
            other => {
                return Err(ExecutionError::InvalidParameters(format!(
                    "unknown mouse button '{}'",
                    other
                )))
            }
        };
        let clicks = parameters.get("clicks").and_then(Value::as_u64).unwrap_or(1).clamp(1, 3);

        self.xdotool(&args([
            "mousemove",
            &x.to_string(),
            &y.to_string(),
            "click",
            "--repeat",
            &clicks.to_string(),
            button,
        ]))
        .await?;
        Ok(json!({"x": x, "y": y, "button": button, "clicks": clicks}))
    }

    async fn hover(&self, parameters: &Parameters) -> Result<Value, ExecutionError> {
        let x = require_i64(parameters, "x")?;
        let y = require_i64(parameters, "y")?;
        self.xdotool(&args(["mousemove", &x.to_string(), &y.to_string()])).await?;
        Ok(json!({"x": x, "y": y}))
    }

    async fn drag(&self, parameters: &Parameters) -> Result<Value, ExecutionError> {
        let sx = require_i64(parameters, "start_x")?;
        let sy = require_i64(parameters, "start_y")?;
        let ex = require_i64(parameters, "end_x")?;
        let ey = require_i64(parameters, "end_y")?;
        self.xdotool(&args([
            "mousemove",
            &sx.to_string(),
            &sy.to_string(),
            "mousedown",
            "1",
            "mousemove",
            &ex.to_string(),
            &ey.to_string(),
            "mouseup",
            "1",
        ]))
        .await?;
        Ok(json!({"from": [sx, sy], "to": [ex, ey]}))
    }

    async fn type_text(&self, parameters: &Parameters) -> Result<Value, ExecutionError> {
        let text = require_str(parameters, "text")?;
        self.xdotool(&args([
            "type",
            "--delay",
            &self.type_delay_ms.to_string(),
            "--",
            text,
        ]))
        .await?;
        Ok(json!({"typed_chars": text.chars().count()}))
    }

    async fn key_press(&self, parameters: &Parameters) -> Result<Value, ExecutionError> {
        let keys = require_str(parameters, "keys")?;
        let combos: Vec<&str> = keys.split_whitespace().collect();
        if combos.is_empty() {
            return Err(ExecutionError::InvalidParameters("'keys' is empty".to_string()));
        }
        let mut argv = vec!["key".to_string(), "--".to_string()];
        argv.extend(combos.iter().map(|c| c.to_string()));
        self.xdotool(&argv).await?;
        Ok(json!({"keys": combos}))
    }

    async fn scroll(&self, parameters: &Parameters) -> Result<Value, ExecutionError> {
        let direction = require_str(parameters, "direction")?;
        let button = scroll_button(direction)?;
        let amount = parameters.get("amount").and_then(Value::as_u64).unwrap_or(3).clamp(1, 50);

        let mut argv = Vec::new();
        if let (Some(x), Some(y)) = (
            parameters.get("x").and_then(Value::as_i64),
            parameters.get("y").and_then(Value::as_i64),
        ) {
            argv.extend(args(["mousemove", &x.to_string(), &y.to_string()]));
        }
        argv.extend(args(["click", "--repeat", &amount.to_string(), button]));
        self.xdotool(&argv).await?;
        Ok(json!({"direction": direction, "amount": amount}))
    }

    async fn screenshot(&self) -> Result<Value, ExecutionError> {
        let output = run_tool("import", &args(["-window", "root", "png:-"]), TOOL_TIMEOUT).await?;
        check_status("import", &output)?;
        let (width, height) = png_dimensions(&output.stdout).ok_or_else(|| ExecutionError::Failed {
            tool: "import".to_string(),
            detail: "output is not a PNG image".to_string(),
        })?;
        debug!(width, height, bytes = output.stdout.len(), "captured screenshot");
        Ok(json!({
            "image_base64": base64::engine::general_purpose::STANDARD.encode(&output.stdout),
            "width": width,
            "height": height,
            "format": "png",
        }))
    }

    async fn run_command(&self, parameters: &Parameters) -> Result<Value, ExecutionError> {
        let command = require_str(parameters, "command")?;
        let limit = parameters
            .get("timeout")
            .and_then(Value::as_f64)
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .map_or(self.command_timeout, |d| d.min(self.command_timeout));

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match timeout(limit, cmd.output()).await {
            Ok(Ok(output)) => Ok(json!({
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr),
                "exit_code": output.status.code().unwrap_or(-1),
                "timed_out": false,
            })),
            Ok(Err(e)) => Err(ExecutionError::ToolMissing {
                tool: "/bin/sh".to_string(),
                source: e,
            }),
            Err(_) => Ok(json!({
                "stdout": "",
                "stderr": format!("Command timed out after {}s", limit.as_secs_f64()),
                "exit_code": -1,
                "timed_out": true,
            })),
        }
    }

    async fn open_url(&self, parameters: &Parameters) -> Result<Value, ExecutionError> {
        let url = require_str(parameters, "url")?;
        check_url(url)?;
        let output = run_tool("xdg-open", &args([url]), TOOL_TIMEOUT).await?;
        check_status("xdg-open", &output)?;
        Ok(json!({"url": url}))
    }

    async fn launch_app(&self, parameters: &Parameters) -> Result<Value, ExecutionError> {
        let app = require_str(parameters, "app_name")?;
        let child = Command::new(app)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ExecutionError::ToolMissing {
                tool: app.to_string(),
                source: e,
            })?;
        Ok(json!({"launched": app, "pid": child.id()}))
    }

    async fn check_app_installed(&self, parameters: &Parameters) -> Result<Value, ExecutionError> {
        let app = require_str(parameters, "app_name")?;
        let output = run_tool("which", &args([app]), TOOL_TIMEOUT).await?;
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let installed = output.status.success() && !path.is_empty();
        Ok(json!({
            "app_name": app,
            "installed": installed,
            "path": if installed { Some(path) } else { None },
        }))
    }
}

#[async_trait]
impl ActionExecutor for DesktopExecutor {
    async fn execute(&self, action: ActionType, parameters: &Parameters) -> Result<Value, ExecutionError> {
        match action {
            ActionType::Click => self.click(parameters).await,
            ActionType::Hover => self.hover(parameters).await,
            ActionType::Drag => self.drag(parameters).await,
            ActionType::TypeText => self.type_text(parameters).await,
            ActionType::KeyPress => self.key_press(parameters).await,
            ActionType::Scroll => self.scroll(parameters).await,
            ActionType::Wait => {
                let seconds = parameters.get("seconds").and_then(Value::as_f64).unwrap_or(-1.0);
                let pause = Duration::try_from_secs_f64(seconds).map_err(|_| {
                    ExecutionError::InvalidParameters("'seconds' must be a non-negative number".to_string())
                })?;
                tokio::time::sleep(pause).await;
                Ok(json!({"waited": seconds}))
            }
            ActionType::Screenshot => self.screenshot().await,
            ActionType::RunCommand => self.run_command(parameters).await,
            ActionType::LaunchApp => self.launch_app(parameters).await,
            ActionType::CheckAppInstalled => self.check_app_installed(parameters).await,
            ActionType::BrowserNavigate
            | ActionType::BrowserClick
            | ActionType::BrowserType
            | ActionType::BrowserHover
            | ActionType::BrowserGetElements
            | ActionType::BrowserGetPageContent
            | ActionType::BrowserGetUrl
            | ActionType::BrowserTakeScreenshot => match &self.browser {
                Some(browser) => browser.execute(action, parameters).await,
                None if action == ActionType::BrowserNavigate => self.open_url(parameters).await,
                None => Err(ExecutionError::Unsupported {
                    action,
                    reason: BROWSER_DRIVER_REQUIRED,
                }),
            },
        }
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

async fn run_tool(program: &str, argv: &[String], limit: Duration) -> Result<Output, ExecutionError> {
    let mut cmd = Command::new(program);
    cmd.args(argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match timeout(limit, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(ExecutionError::ToolMissing {
            tool: program.to_string(),
            source: e,
        }),
        Err(_) => Err(ExecutionError::TimedOut(limit)),
    }
}

fn check_status(tool: &str, output: &Output) -> Result<(), ExecutionError> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(ExecutionError::Failed {
        tool: tool.to_string(),
        detail: format!(
            "exit code {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        ),
    })
}

/// X11 mouse button for a scroll direction
fn scroll_button(direction: &str) -> Result<&'static str, ExecutionError> {
    match direction.to_ascii_lowercase().as_str() {
        "up" => Ok("4"),
        "down" => Ok("5"),
        "left" => Ok("6"),
        "right" => Ok("7"),
        other => Err(ExecutionError::InvalidParameters(format!(
            "unknown scroll direction '{}'",
            other
        ))),
    }
}

/// Width and height from a PNG's IHDR chunk
pub(crate) fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    if bytes.len() < 24 || bytes[..8] != SIGNATURE || &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(bytes[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(bytes[20..24].try_into().ok()?);
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    fn png_header(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes
    }

    #[test]
    fn test_png_dimensions() {
        assert_eq!(png_dimensions(&png_header(1920, 1080)), Some((1920, 1080)));
        assert_eq!(png_dimensions(b"GIF89a and more bytes here"), None);
        assert_eq!(png_dimensions(&[]), None);
    }

    #[test]
    fn test_scroll_button_mapping() {
        assert_eq!(scroll_button("down").unwrap(), "5");
        assert_eq!(scroll_button("UP").unwrap(), "4");
        assert!(scroll_button("sideways").is_err());
    }

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let executor = DesktopExecutor::new(Duration::from_secs(10));
        let payload = executor
            .execute(
                ActionType::RunCommand,
                &params(json!({"command": "echo hello; echo oops >&2; exit 3"})),
            )
            .await
            .unwrap();
        assert_eq!(payload["stdout"], "hello\n");
        assert_eq!(payload["stderr"], "oops\n");
        assert_eq!(payload["exit_code"], 3);
        assert_eq!(payload["timed_out"], false);
    }

    #[tokio::test]
    async fn test_run_command_timeout_reported_in_payload() {
        let executor = DesktopExecutor::new(Duration::from_millis(200));
        let payload = executor
            .execute(ActionType::RunCommand, &params(json!({"command": "sleep 5"})))
            .await
            .unwrap();
        assert_eq!(payload["timed_out"], true);
        assert_eq!(payload["exit_code"], -1);
    }

    #[tokio::test]
    async fn test_check_app_installed() {
        let executor = DesktopExecutor::new(Duration::from_secs(5));
        let payload = executor
            .execute(
                ActionType::CheckAppInstalled,
                &params(json!({"app_name": "definitely-not-installed-xyz"})),
            )
            .await;
        // `which` itself may be absent on minimal images
        if let Ok(payload) = payload {
            assert_eq!(payload["installed"], false);
            assert_eq!(payload["path"], Value::Null);
        }
    }

    #[tokio::test]
    async fn test_browser_actions_unsupported_without_browser() {
        let executor = DesktopExecutor::new(Duration::from_secs(5));
        let err = executor
            .execute(ActionType::BrowserClick, &params(json!({"element_index": 3})))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_wait_rejects_negative_seconds() {
        let executor = DesktopExecutor::new(Duration::from_secs(5));
        let err = executor
            .execute(ActionType::Wait, &params(json!({"seconds": -1})))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidParameters(_)));
    }
}
