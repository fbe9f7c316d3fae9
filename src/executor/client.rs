//! WebSocket client that connects the executor to the server
//!
//! One connection at a time: handshake, then serve commands until the socket
//! drops, then reconnect after `reconnect_interval`. Each command runs on its
//! own task and produces exactly one `result` frame.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{system_info, ActionExecutor, CLIENT_VERSION};
use crate::config::ClientConfig;
use crate::protocol::{
    AckStatus, CommandEnvelope, ErrorCode, Frame, ProtocolError, ResultEnvelope, MAX_FRAME_BYTES,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("server rejected the handshake: {0}")]
    Rejected(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("gave up after {attempts} failed connection attempts: {last}")]
    GaveUp { attempts: u32, last: String },
}

/// How a served connection ended
enum SessionEnd {
    Shutdown,
    Disconnected,
}

pub struct ControllerClient {
    config: ClientConfig,
    executor: Arc<dyn ActionExecutor>,
}

impl ControllerClient {
    pub fn new(config: ClientConfig, executor: Arc<dyn ActionExecutor>) -> Self {
        Self { config, executor }
    }

    /// Connect and serve until `shutdown` fires, reconnecting on drops
    ///
    /// Returns an error when the server rejects the API key or after
    /// `max_reconnect_attempts` consecutive failed connection attempts.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ClientError> {
        let mut failures: u32 = 0;

        loop {
            match self.connect_and_serve(&shutdown).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Disconnected) => {
                    failures = 0;
                    info!("connection to server lost, reconnecting");
                }
                Err(ClientError::Rejected(reason)) => {
                    error!(reason = %reason, "server rejected credentials");
                    return Err(ClientError::Rejected(reason));
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.config.max_reconnect_attempts {
                        return Err(ClientError::GaveUp {
                            attempts: failures,
                            last: e.to_string(),
                        });
                    }
                    warn!(
                        error = %e,
                        attempt = failures,
                        max_attempts = self.config.max_reconnect_attempts,
                        "connection attempt failed"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
    }

    async fn connect_and_serve(&self, shutdown: &CancellationToken) -> Result<SessionEnd, ClientError> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(MAX_FRAME_BYTES),
            max_frame_size: Some(MAX_FRAME_BYTES),
            ..WebSocketConfig::default()
        };
        let (ws, _) = tokio_tungstenite::connect_async_with_config(
            self.config.server_url.as_str(),
            Some(ws_config),
            false,
        )
        .await?;
        let (mut sink, mut stream) = ws.split();

        let handshake = Frame::Handshake {
            request_id: Uuid::now_v7().to_string(),
            api_key: self.config.api_key.clone(),
            client_version: CLIENT_VERSION.to_string(),
            system_info: system_info(),
        };
        sink.send(Message::Text(handshake.encode()?.into())).await?;

        let machine_id = match timeout(HANDSHAKE_TIMEOUT, next_frame(&mut stream)).await {
            Err(_) => return Err(ClientError::Handshake("no handshake_ack from server".to_string())),
            Ok(None) => return Err(ClientError::Handshake("server closed during handshake".to_string())),
            Ok(Some(frame)) => match frame? {
                Frame::HandshakeAck {
                    status: AckStatus::Ok,
                    machine_id,
                    ..
                } => machine_id,
                Frame::HandshakeAck { message, .. } => return Err(ClientError::Rejected(message)),
                Frame::Error {
                    code: ErrorCode::NotAuthenticated,
                    message,
                    ..
                } => return Err(ClientError::Rejected(message)),
                other => {
                    return Err(ClientError::Handshake(format!(
                        "expected handshake_ack, got {}",
                        other.kind()
                    )))
                }
            },
        };
        info!(machine_id = %machine_id, server = %self.config.server_url, "connected to server");

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);
        let writer_stop = CancellationToken::new();
        let writer = {
            let stop = writer_stop.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = stop.cancelled() => break,
                        frame = out_rx.recv() => match frame {
                            Some(frame) => frame,
                            None => break,
                        },
                    };
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "failed to encode outbound frame");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!(error = %e, "write to server failed");
                        break;
                    }
                }
                let _ = sink.close().await;
            })
        };

        let end = loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,
                message = stream.next() => message,
            };

            match message {
                Some(Ok(Message::Text(text))) => self.handle_text(&text, &out_tx),
                Some(Ok(Message::Close(_))) | None => break SessionEnd::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "read from server failed");
                    break SessionEnd::Disconnected;
                }
            }
        };

        writer_stop.cancel();
        let _ = writer.await;
        Ok(end)
    }

    fn handle_text(&self, text: &str, out_tx: &mpsc::Sender<Frame>) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                reject_undecodable(text, &e, out_tx);
                return;
            }
        };

        match frame {
            Frame::Command(command) => {
                let executor = Arc::clone(&self.executor);
                let tx = out_tx.clone();
                let span = info_span!(
                    "execute",
                    otel.name = %format!("execute {}", command.action),
                    correlation_id = %command.correlation_id,
                    action = %command.action,
                );
                tokio::spawn(
                    async move {
                        let result = execute_command(executor.as_ref(), command).await;
                        debug!(status = result.status.as_str(), "command finished");
                        if tx.send(Frame::Result(result)).await.is_err() {
                            warn!("connection closed before result could be sent");
                        }
                    }
                    .instrument(span),
                );
            }
            Frame::Ping { request_id } => {
                if out_tx.try_send(Frame::Pong { request_id }).is_err() {
                    debug!("outbound queue full, skipped pong");
                }
            }
            Frame::Pong { .. } => {}
            Frame::Error { code, message, .. } => {
                warn!(code = code.as_str(), message = %message, "server reported an error");
            }
            other => {
                debug!(kind = other.kind(), "ignoring unexpected frame");
            }
        }
    }
}

/// Run one command and turn its outcome into a result envelope
pub async fn execute_command(executor: &dyn ActionExecutor, command: CommandEnvelope) -> ResultEnvelope {
    if let Err(e) = command.action.validate(&command.parameters) {
        return ResultEnvelope::coded_error(command.correlation_id, ErrorCode::InvalidParameters, e.to_string());
    }
    match executor.execute(command.action, &command.parameters).await {
        Ok(payload) => ResultEnvelope::ok(command.correlation_id, payload),
        Err(e) if e.is_timeout() => ResultEnvelope::timeout(command.correlation_id),
        Err(e) => ResultEnvelope::coded_error(command.correlation_id, e.code(), e.to_string()),
    }
}

/// Answer a frame that failed to decode
///
/// A command with an unknown action still carries its correlation id, so it
/// gets an error result instead of leaving the server waiting.
fn reject_undecodable(text: &str, err: &ProtocolError, out_tx: &mpsc::Sender<Frame>) {
    let value: Value = serde_json::from_str(text).unwrap_or(Value::Null);
    let correlation_id = value.get("correlation_id").and_then(Value::as_str);

    let reply = match (value.get("type").and_then(Value::as_str), correlation_id) {
        (Some("command"), Some(id)) => {
            let action = value.get("action").and_then(Value::as_str).unwrap_or("<missing>");
            Frame::Result(ResultEnvelope::coded_error(
                id,
                ErrorCode::UnknownCommand,
                format!("unknown command '{}'", action),
            ))
        }
        _ => Frame::error("", ErrorCode::InvalidMessage, err.to_string()),
    };
    warn!(error = %err, "rejected undecodable frame");
    if out_tx.try_send(reply).is_err() {
        debug!("outbound queue full, dropped rejection");
    }
}

async fn next_frame<S>(stream: &mut S) -> Option<Result<Frame, ClientError>>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(Frame::decode(&text).map_err(ClientError::from)),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => return Some(Err(e.into())),
        }
    }
    None
}
