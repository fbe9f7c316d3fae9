//! HTTP operations API served next to the controller WebSocket
//!
//! - `GET    /api/agents` - connected controllers
//! - `POST   /api/agents/{agent_id}/commands` - one-off dispatch
//! - `POST   /api/agents/{agent_id}/runs` - start an agent session
//! - `GET    /api/runs`, `GET /api/runs/{session_id}` - session status
//! - `DELETE /api/runs/{session_id}` - cancel a session
//! - `GET    /metrics`, `GET /health`

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::{AgentController, RunRegistry, RunStatus, RunView, StepSink};
use crate::backend::DecisionSource;
use crate::config::AgentConfig;
use crate::controller::{AgentHandle, ConnectionInfo, DispatchError, Dispatcher};
use crate::metrics;
use crate::protocol::{ActionType, Parameters};

/// Shared state for the API handlers
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub runs: Arc<RunRegistry>,
    pub decider: Arc<dyn DecisionSource>,
    pub sink: Arc<dyn StepSink>,
    pub agent_config: AgentConfig,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub action: String,
    #[serde(default)]
    pub parameters: Parameters,
    pub timeout_secs: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub task: String,
}

#[derive(Debug, Serialize)]
pub struct RunStarted {
    pub session_id: String,
    pub agent_id: String,
}

/// Error body: `{"error": "...", "kind": "..."}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        let status = match &e {
            DispatchError::ChannelNotFound { .. } => StatusCode::NOT_FOUND,
            DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::RemoteExecution { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::InvalidCommand(_) => StatusCode::BAD_REQUEST,
            DispatchError::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        };
        ApiError::new(status, e.outcome(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"error": self.message, "kind": self.kind})),
        )
            .into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{agent_id}/commands", post(dispatch_command))
        .route("/api/agents/{agent_id}/runs", post(start_run))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{session_id}", get(get_run).delete(cancel_run))
        .route("/metrics", get(prometheus_metrics))
        .route("/health", get(health))
        .with_state(state)
}

async fn list_agents(State(state): State<ApiState>) -> Json<Vec<ConnectionInfo>> {
    Json(state.dispatcher.channels().snapshot())
}

async fn dispatch_command(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<Value>, ApiError> {
    let action: ActionType = request
        .action
        .parse()
        .map_err(|e: crate::protocol::ProtocolError| {
            ApiError::new(StatusCode::BAD_REQUEST, "invalid_command", e.to_string())
        })?;
    let timeout = match request.timeout_secs {
        None => None,
        Some(secs) => Some(
            Duration::try_from_secs_f64(secs)
                .ok()
                .filter(|d| !d.is_zero())
                .ok_or_else(|| {
                    ApiError::new(
                        StatusCode::BAD_REQUEST,
                        "invalid_command",
                        "timeout_secs must be a positive number",
                    )
                })?,
        ),
    };

    let payload = state
        .dispatcher
        .dispatch(&agent_id, action, request.parameters, timeout)
        .await?;
    Ok(Json(json!({"status": "ok", "payload": payload})))
}

async fn start_run(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
    Json(request): Json<RunRequest>,
) -> Result<(StatusCode, Json<RunStarted>), ApiError> {
    if request.task.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "invalid_task", "task must not be empty"));
    }
    if state.dispatcher.channels().get(&agent_id).is_none() {
        return Err(DispatchError::ChannelNotFound { agent_id }.into());
    }

    let target = Arc::new(AgentHandle::new(Arc::clone(&state.dispatcher), agent_id.clone()));
    let controller = Arc::new(AgentController::new(
        target,
        Arc::clone(&state.decider),
        Arc::clone(&state.sink),
        state.agent_config.clone(),
    ));
    let session_id = state.runs.start(controller, &agent_id, request.task);
    tracing::info!(session_id = %session_id, agent_id = %agent_id, "agent run started via api");

    Ok((StatusCode::ACCEPTED, Json(RunStarted { session_id, agent_id })))
}

async fn list_runs(State(state): State<ApiState>) -> Json<Vec<RunView>> {
    Json(state.runs.list())
}

async fn get_run(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<RunView>, ApiError> {
    state
        .runs
        .get(&session_id)
        .map(Json)
        .ok_or_else(|| run_not_found(&session_id))
}

async fn cancel_run(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let view = state.runs.get(&session_id).ok_or_else(|| run_not_found(&session_id))?;
    if view.status == RunStatus::Finished || !state.runs.cancel(&session_id) {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "run_finished",
            format!("run {} already finished", session_id),
        ));
    }
    Ok(StatusCode::ACCEPTED)
}

fn run_not_found(session_id: &str) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "run_not_found", format!("no run {}", session_id))
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}
