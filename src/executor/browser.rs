//! Browser actions over the Chrome DevTools Protocol
//!
//! Drives a Chromium started with `--remote-debugging-port`. The first page
//! target listed by `/json/list` is attached over its DevTools WebSocket, and
//! the session is reopened lazily once that socket drops. Page elements are
//! addressed by the index stamped on them by the last `browser_get_elements`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::desktop::png_dimensions;
use super::{check_url, require_i64, require_str, ActionExecutor, ExecutionError};
use crate::protocol::{ActionType, Parameters};

type CdpSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, BrowserError>>>>>;

/// Attribute carrying an element's index between listing and interaction
const INDEX_ATTRIBUTE: &str = "data-sencha-idx";

const READY_POLL: Duration = Duration::from_millis(100);

/// Marks visible interactive elements with their index and describes them
const COLLECT_ELEMENTS: &str = r#"(() => {
  const candidates = document.querySelectorAll(
    'a, button, input, select, textarea, [role], [onclick], [tabindex]');
  const out = [];
  for (const el of candidates) {
    const style = window.getComputedStyle(el);
    const rect = el.getBoundingClientRect();
    if (style.display === 'none' || style.visibility === 'hidden' || style.opacity === '0'
        || rect.width <= 0 || rect.height <= 0) {
      continue;
    }
    const idx = out.length;
    el.setAttribute('data-sencha-idx', String(idx));
    out.push({
      idx,
      tag: el.tagName.toLowerCase(),
      text: (el.textContent || '').trim().substring(0, 100),
      role: el.getAttribute('role') || '',
      label: el.getAttribute('aria-label') || '',
      placeholder: el.getAttribute('placeholder') || '',
      type: el.getAttribute('type') || '',
      name: el.getAttribute('name') || '',
      id: el.id || '',
      href: el.getAttribute('href') || '',
    });
  }
  return out;
})()"#;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("no browser reachable at {url}: {reason}")]
    Unavailable { url: String, reason: String },

    #[error("DevTools error {code}: {message}")]
    Cdp { code: i64, message: String },

    #[error("DevTools call '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("DevTools connection lost")]
    Disconnected,

    #[error("no page element with index {0}; list the page elements again")]
    ElementNotFound(i64),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("page script failed: {0}")]
    Script(String),

    #[error("unexpected DevTools reply: {0}")]
    Protocol(String),
}

#[derive(Deserialize)]
struct DevtoolsTarget {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    ws_url: Option<String>,
}

#[derive(Deserialize)]
struct CdpReply {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<CdpFault>,
}

#[derive(Deserialize)]
struct CdpFault {
    code: i64,
    message: String,
}

/// One attached DevTools WebSocket with id-correlated calls
struct CdpSession {
    next_id: AtomicU64,
    waiters: Waiters,
    writer: tokio::sync::Mutex<SplitSink<CdpSocket, Message>>,
    closed: CancellationToken,
}

impl CdpSession {
    async fn connect(ws_url: &str) -> Result<Arc<Self>, BrowserError> {
        let (socket, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| BrowserError::Unavailable {
                url: ws_url.to_string(),
                reason: e.to_string(),
            })?;
        let (writer, reader) = socket.split();

        let session = Arc::new(Self {
            next_id: AtomicU64::new(1),
            waiters: Arc::default(),
            writer: tokio::sync::Mutex::new(writer),
            closed: CancellationToken::new(),
        });
        tokio::spawn(read_replies(
            reader,
            Arc::clone(&session.waiters),
            session.closed.clone(),
        ));
        Ok(session)
    }

    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, BrowserError> {
        if self.closed.is_cancelled() {
            return Err(BrowserError::Disconnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);

        let request = json!({"id": id, "method": method, "params": params}).to_string();
        let sent = self.writer.lock().await.send(Message::Text(request.into())).await;
        if let Err(e) = sent {
            self.waiters.lock().remove(&id);
            self.closed.cancel();
            debug!(error = %e, method, "DevTools write failed");
            return Err(BrowserError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(BrowserError::Disconnected),
            Err(_) => {
                self.waiters.lock().remove(&id);
                Err(BrowserError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }
}

/// Route replies to their callers; events (no `id`) are ignored
async fn read_replies(mut reader: SplitStream<CdpSocket>, waiters: Waiters, closed: CancellationToken) {
    while let Some(message) = reader.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "DevTools read failed");
                break;
            }
        };
        let reply: CdpReply = match serde_json::from_str(&text) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "skipping unparseable DevTools message");
                continue;
            }
        };
        let Some(id) = reply.id else { continue };
        let waiter = waiters.lock().remove(&id);
        if let Some(tx) = waiter {
            let outcome = match reply.error {
                Some(fault) => Err(BrowserError::Cdp {
                    code: fault.code,
                    message: fault.message,
                }),
                None => Ok(reply.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(outcome);
        }
    }

    closed.cancel();
    let stranded: Vec<_> = waiters.lock().drain().collect();
    for (_, tx) in stranded {
        let _ = tx.send(Err(BrowserError::Disconnected));
    }
}

/// [`ActionExecutor`] for the `browser_*` actions
pub struct BrowserExecutor {
    devtools_url: String,
    http: reqwest::Client,
    call_timeout: Duration,
    session: tokio::sync::Mutex<Option<Arc<CdpSession>>>,
}

impl BrowserExecutor {
    /// `devtools_url` is the HTTP endpoint, e.g. `http://127.0.0.1:9222`
    pub fn new(devtools_url: impl Into<String>, call_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(call_timeout).build()?;
        Ok(Self {
            devtools_url: devtools_url.into().trim_end_matches('/').to_string(),
            http,
            call_timeout,
            session: tokio::sync::Mutex::new(None),
        })
    }

    pub fn devtools_url(&self) -> &str {
        &self.devtools_url
    }

    async fn session(&self) -> Result<Arc<CdpSession>, BrowserError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref().filter(|s| !s.closed.is_cancelled()) {
            return Ok(Arc::clone(session));
        }
        let ws_url = self.find_page().await?;
        let session = CdpSession::connect(&ws_url).await?;
        info!(target = %ws_url, "attached to browser page");
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn find_page(&self) -> Result<String, BrowserError> {
        let unavailable = |reason: String| BrowserError::Unavailable {
            url: self.devtools_url.clone(),
            reason,
        };
        let targets: Vec<DevtoolsTarget> = self
            .http
            .get(format!("{}/json/list", self.devtools_url))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        targets
            .into_iter()
            .filter(|t| t.kind == "page")
            .find_map(|t| t.ws_url)
            .ok_or_else(|| unavailable("no open page".to_string()))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, BrowserError> {
        self.session().await?.call(method, params, self.call_timeout).await
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({"expression": expression, "returnByValue": true, "awaitPromise": true}),
            )
            .await?;
        if let Some(exception) = result.get("exceptionDetails") {
            let message = exception
                .pointer("/exception/description")
                .or_else(|| exception.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("uncaught exception");
            return Err(BrowserError::Script(message.to_string()));
        }
        Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
    }

    async fn mouse(&self, kind: &str, (x, y): (f64, f64)) -> Result<(), BrowserError> {
        self.call(
            "Input.dispatchMouseEvent",
            json!({"type": kind, "x": x, "y": y, "button": "left", "clickCount": 1}),
        )
        .await
        .map(drop)
    }

    /// Scroll the element into view and return its centre in CSS pixels
    async fn element_center(&self, index: i64) -> Result<(f64, f64), BrowserError> {
        let script = format!(
            "(() => {{ const el = document.querySelector('[{attr}=\"{index}\"]'); \
             if (!el) return null; \
             el.scrollIntoView({{block: 'center', inline: 'center'}}); \
             const r = el.getBoundingClientRect(); \
             return [r.left + r.width / 2, r.top + r.height / 2]; }})()",
            attr = INDEX_ATTRIBUTE,
            index = index,
        );
        let point = self.evaluate(&script).await?;
        match (
            point.get(0).and_then(Value::as_f64),
            point.get(1).and_then(Value::as_f64),
        ) {
            (Some(x), Some(y)) => Ok((x, y)),
            _ => Err(BrowserError::ElementNotFound(index)),
        }
    }

    async fn wait_until_loaded(&self) -> Result<(), BrowserError> {
        let deadline = tokio::time::Instant::now() + self.call_timeout;
        loop {
            let state = self.evaluate("document.readyState").await?;
            if state.as_str() != Some("loading") {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrowserError::Timeout {
                    method: "page load".to_string(),
                    timeout: self.call_timeout,
                });
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn navigate(&self, parameters: &Parameters) -> Result<Value, ExecutionError> {
        let url = require_str(parameters, "url")?;
        check_url(url)?;
        let result = self.call("Page.navigate", json!({"url": url})).await?;
        if let Some(reason) = result.get("errorText").and_then(Value::as_str) {
            return Err(BrowserError::Navigation(reason.to_string()).into());
        }
        self.wait_until_loaded().await?;
        Ok(json!({"url": url}))
    }

    async fn click(&self, parameters: &Parameters) -> Result<Value, ExecutionError> {
        let index = element_index(parameters)?;
        let point = self.element_center(index).await?;
        for kind in ["mouseMoved", "mousePressed", "mouseReleased"] {
            self.mouse(kind, point).await?;
        }
        Ok(json!({"element_index": index, "x": point.0, "y": point.1}))
    }

    async fn hover(&self, parameters: &Parameters) -> Result<Value, ExecutionError> {
        let index = element_index(parameters)?;
        let point = self.element_center(index).await?;
        self.mouse("mouseMoved", point).await?;
        Ok(json!({"element_index": index}))
    }

    /// Replace the element's value, like a form fill
    async fn type_into(&self, parameters: &Parameters) -> Result<Value, ExecutionError> {
        let index = element_index(parameters)?;
        let text = require_str(parameters, "text")?;
        let script = format!(
            "(() => {{ const el = document.querySelector('[{attr}=\"{index}\"]'); \
             if (!el) return false; \
             el.focus(); \
             if ('value' in el) {{ el.value = ''; el.dispatchEvent(new Event('input', {{bubbles: true}})); }} \
             return true; }})()",
            attr = INDEX_ATTRIBUTE,
            index = index,
        );
        if self.evaluate(&script).await? != Value::Bool(true) {
            return Err(BrowserError::ElementNotFound(index).into());
        }
        self.call("Input.insertText", json!({"text": text})).await?;
        Ok(json!({"element_index": index, "typed_chars": text.chars().count()}))
    }

    async fn elements(&self) -> Result<Value, ExecutionError> {
        let elements = match self.evaluate(COLLECT_ELEMENTS).await? {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        Ok(json!({
            "count": elements.len(),
            "listing": describe_elements(&elements),
            "elements": elements,
        }))
    }

    async fn screenshot(&self) -> Result<Value, ExecutionError> {
        let result = self.call("Page.captureScreenshot", json!({"format": "png"})).await?;
        let data = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Protocol("screenshot without data".to_string()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| BrowserError::Protocol(format!("screenshot is not base64: {}", e)))?;
        let (width, height) =
            png_dimensions(&bytes).ok_or_else(|| BrowserError::Protocol("screenshot is not a PNG".to_string()))?;
        Ok(json!({
            "image_base64": data,
            "width": width,
            "height": height,
            "format": "png",
        }))
    }
}

#[async_trait]
impl ActionExecutor for BrowserExecutor {
    async fn execute(&self, action: ActionType, parameters: &Parameters) -> Result<Value, ExecutionError> {
        match action {
            ActionType::BrowserNavigate => self.navigate(parameters).await,
            ActionType::BrowserClick => self.click(parameters).await,
            ActionType::BrowserHover => self.hover(parameters).await,
            ActionType::BrowserType => self.type_into(parameters).await,
            ActionType::BrowserGetElements => self.elements().await,
            ActionType::BrowserGetPageContent => {
                let text = self
                    .evaluate("document.body ? document.body.innerText : ''")
                    .await?;
                Ok(json!({"content": text.as_str().unwrap_or_default()}))
            }
            ActionType::BrowserGetUrl => {
                let url = self.evaluate("window.location.href").await?;
                Ok(json!({"url": url.as_str().unwrap_or_default()}))
            }
            ActionType::BrowserTakeScreenshot => self.screenshot().await,
            other => Err(ExecutionError::Unsupported {
                action: other,
                reason: "not a browser action",
            }),
        }
    }
}

fn element_index(parameters: &Parameters) -> Result<i64, ExecutionError> {
    let index = require_i64(parameters, "element_index")?;
    if index < 0 {
        return Err(ExecutionError::InvalidParameters(
            "'element_index' must not be negative".to_string(),
        ));
    }
    Ok(index)
}

/// One line per element: `[3] <button> text="Save" id="save"`
fn describe_elements(elements: &[Value]) -> String {
    const FIELDS: [(&str, &str); 8] = [
        ("text", "text"),
        ("role", "role"),
        ("label", "aria-label"),
        ("placeholder", "placeholder"),
        ("type", "type"),
        ("name", "name"),
        ("id", "id"),
        ("href", "href"),
    ];

    let mut lines = Vec::with_capacity(elements.len());
    for element in elements.iter().filter(|e| e.is_object()) {
        let idx = element.get("idx").map_or_else(|| "?".to_string(), Value::to_string);
        let tag = element.get("tag").and_then(Value::as_str).unwrap_or("unknown");
        let mut line = format!("[{}] <{}>", idx, tag);
        for (key, label) in FIELDS {
            if let Some(value) = element.get(key).and_then(Value::as_str).filter(|v| !v.is_empty()) {
                line.push_str(&format!(" {}={:?}", label, value));
            }
        }
        lines.push(line);
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_elements_skips_empty_fields() {
        let elements = vec![
            json!({"idx": 0, "tag": "a", "text": "Docs", "href": "/docs", "role": ""}),
            json!({"idx": 1, "tag": "input", "placeholder": "Search", "type": "text"}),
            json!("not an element"),
        ];
        assert_eq!(
            describe_elements(&elements),
            "[0] <a> text=\"Docs\" href=\"/docs\"\n[1] <input> placeholder=\"Search\" type=\"text\""
        );
    }

    #[test]
    fn test_negative_element_index_rejected() {
        let parameters = json!({"element_index": -1}).as_object().cloned().unwrap();
        assert!(matches!(
            element_index(&parameters),
            Err(ExecutionError::InvalidParameters(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_browser_is_unavailable() {
        // Nothing listens on the discard port
        let browser = BrowserExecutor::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = browser
            .execute(ActionType::BrowserGetUrl, &Parameters::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Browser(BrowserError::Unavailable { .. })));
    }
}
