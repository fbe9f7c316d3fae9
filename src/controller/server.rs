//! WebSocket endpoint for remote controllers
//!
//! Per connection: read the handshake (bounded by a timeout), authenticate,
//! register the channel, then run a writer task (outbound queue + heartbeat
//! pings) next to a reader loop that only touches the pending registry.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::auth::{AuthVerdict, Authenticator, HandshakeRequest};
use super::channel::{AgentConnection, ChannelRegistry};
use crate::metrics::{CHANNEL_EVENTS, FRAMES_RECEIVED};
use crate::protocol::{
    AckStatus, ErrorCode, Frame, ResultEnvelope, CONTROLLER_WS_PATH, MAX_FRAME_BYTES,
};

/// Timing knobs for controller sockets
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub outbound_buffer: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            outbound_buffer: 64,
        }
    }
}

#[derive(Clone)]
pub struct ControllerState {
    pub channels: Arc<ChannelRegistry>,
    pub authenticator: Arc<dyn Authenticator>,
    pub settings: ChannelSettings,
}

pub fn router(state: ControllerState) -> Router {
    Router::new()
        .route(CONTROLLER_WS_PATH, get(controller_ws))
        .with_state(state)
}

async fn controller_ws(
    ws: WebSocketUpgrade,
    State(state): State<ControllerState>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ControllerState) {
    let Some((request_id, request)) =
        read_handshake(&mut socket, state.settings.handshake_timeout).await
    else {
        return;
    };

    let machine_id = match state.authenticator.authenticate(&request).await {
        AuthVerdict::Authenticated { machine_id } => machine_id,
        AuthVerdict::Rejected { reason } => {
            CHANNEL_EVENTS.with_label_values(&["rejected"]).inc();
            tracing::warn!(reason = %reason, "controller handshake rejected");
            let ack = Frame::HandshakeAck {
                request_id,
                status: AckStatus::Error,
                message: reason,
                machine_id: String::new(),
            };
            let _ = send_direct(&mut socket, &ack).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (tx, rx) = mpsc::channel(state.settings.outbound_buffer);
    let conn = state
        .channels
        .connect(&machine_id, tx, request.system_info.clone());

    let ack = Frame::HandshakeAck {
        request_id,
        status: AckStatus::Ok,
        message: "authenticated".to_string(),
        machine_id: machine_id.clone(),
    };
    if send_direct(&mut socket, &ack).await.is_err() {
        state.channels.disconnect(&conn, "handshake ack failed");
        return;
    }
    tracing::info!(
        machine_id = %machine_id,
        client_version = %request.client_version,
        "controller authenticated"
    );

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        sink,
        rx,
        conn.clone(),
        state.settings.heartbeat_interval,
    ));

    read_loop(stream, &conn).await;

    state.channels.disconnect(&conn, "connection closed");
    let _ = writer.await;
}

/// Wait for the first frame and require it to be a handshake
async fn read_handshake(
    socket: &mut WebSocket,
    timeout: Duration,
) -> Option<(String, HandshakeRequest)> {
    let first = match tokio::time::timeout(timeout, socket.recv()).await {
        Ok(Some(Ok(message))) => message,
        Ok(_) => return None,
        Err(_) => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "controller handshake timed out");
            reject(socket, "handshake timed out").await;
            return None;
        }
    };

    let frame = match &first {
        Message::Text(text) => Frame::decode(text.as_str()).ok(),
        _ => None,
    };

    match frame {
        Some(Frame::Handshake {
            request_id,
            api_key,
            client_version,
            system_info,
        }) => Some((
            request_id,
            HandshakeRequest {
                api_key,
                client_version,
                system_info,
            },
        )),
        _ => {
            tracing::warn!("first controller frame was not a handshake");
            reject(socket, "first frame must be a handshake").await;
            None
        }
    }
}

async fn reject(socket: &mut WebSocket, message: &str) {
    CHANNEL_EVENTS.with_label_values(&["rejected"]).inc();
    let frame = Frame::error("", ErrorCode::NotAuthenticated, message);
    let _ = send_direct(socket, &frame).await;
    let _ = socket.send(Message::Close(None)).await;
}

async fn send_direct(socket: &mut WebSocket, frame: &Frame) -> Result<(), axum::Error> {
    match frame.encode() {
        Ok(text) => socket.send(Message::Text(text.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode frame");
            Ok(())
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Frame>,
    conn: Arc<AgentConnection>,
    heartbeat_interval: Duration,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    // First tick completes immediately
    heartbeat.tick().await;

    loop {
        let frame = tokio::select! {
            _ = conn.closed_token().cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = heartbeat.tick() => Frame::ping(),
        };

        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, kind = frame.kind(), "failed to encode frame");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            tracing::debug!(machine_id = conn.machine_id(), error = %e, "controller socket write failed");
            conn.close("socket write failed");
            break;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}

async fn read_loop(mut stream: SplitStream<WebSocket>, conn: &AgentConnection) {
    loop {
        let message = tokio::select! {
            _ = conn.closed_token().cancelled() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => handle_text(text.as_str(), conn),
            Some(Ok(Message::Binary(_))) => {
                conn.touch();
                conn.try_send(Frame::error(
                    "",
                    ErrorCode::InvalidMessage,
                    "binary frames are not supported",
                ));
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => conn.touch(),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::debug!(machine_id = conn.machine_id(), error = %e, "controller socket read failed");
                break;
            }
        }
    }
}

fn handle_text(text: &str, conn: &AgentConnection) {
    conn.touch();

    let frame = match Frame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            FRAMES_RECEIVED.with_label_values(&["invalid"]).inc();
            tracing::warn!(machine_id = conn.machine_id(), error = %e, "invalid controller frame");
            conn.try_send(Frame::error("", ErrorCode::InvalidMessage, e.to_string()));
            return;
        }
    };
    FRAMES_RECEIVED.with_label_values(&[frame.kind()]).inc();

    match frame {
        Frame::Result(result) => {
            let correlation_id = result.correlation_id.clone();
            if !conn.on_receive(result) {
                tracing::debug!(machine_id = conn.machine_id(), correlation_id = %correlation_id, "late or unknown result dropped");
            }
        }
        Frame::Pong { .. } => {}
        Frame::Ping { request_id } => {
            conn.try_send(Frame::Pong { request_id });
        }
        Frame::Error {
            request_id,
            code,
            message,
        } => {
            if conn.pending().contains(&request_id) {
                let detail = format!("{}: {}", code.as_str(), message);
                conn.pending().resolve(
                    &request_id,
                    ResultEnvelope::coded_error(request_id.clone(), code, detail),
                );
            } else {
                tracing::warn!(
                    machine_id = conn.machine_id(),
                    code = code.as_str(),
                    message = %message,
                    "controller reported an error"
                );
            }
        }
        other => {
            tracing::warn!(machine_id = conn.machine_id(), kind = other.kind(), "unexpected frame from controller");
            conn.try_send(Frame::error(
                "",
                ErrorCode::InvalidMessage,
                format!("unexpected {} frame", other.kind()),
            ));
        }
    }
}
