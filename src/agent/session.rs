//! Session outcomes, the step sink seam, and JSON session files
//!
//! The agent loop hands every finished step and the final outcome to a
//! [`StepSink`]. [`SessionStore`] is the shipped sink: one pretty-printed JSON
//! file per session, rewritten after each step so a crash keeps the partial
//! history.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::context::StepRecord;

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Success,
    Failure,
    MaxStepsExceeded,
    Cancelled,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Success => "success",
            TerminationReason::Failure => "failure",
            TerminationReason::MaxStepsExceeded => "max_steps_exceeded",
            TerminationReason::Cancelled => "cancelled",
        }
    }
}

/// Final result of one agent session, including its full step history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub session_id: String,
    pub agent_id: String,
    pub task: String,
    pub reason: TerminationReason,
    pub detail: String,
    pub steps: u32,
    pub history: Vec<StepRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Receives step records and outcomes as a session progresses
///
/// Implementations log their own failures; a sink can never fail a session.
#[async_trait]
pub trait StepSink: Send + Sync {
    async fn session_started(&self, _session_id: &str, _agent_id: &str, _task: &str) {}

    async fn record_step(&self, session_id: &str, record: &StepRecord);

    async fn record_outcome(&self, outcome: &SessionOutcome);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl StepSink for NullSink {
    async fn record_step(&self, _session_id: &str, _record: &StepRecord) {}

    async fn record_outcome(&self, _outcome: &SessionOutcome) {}
}

/// A persisted session file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub task: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    /// Set once the session terminated
    pub outcome: Option<SessionResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub reason: TerminationReason,
    pub detail: String,
}

impl Session {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>, task: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            task: task.into(),
            created_at: now,
            updated_at: now,
            steps: Vec::new(),
            outcome: None,
        }
    }

    pub fn add_step(&mut self, record: StepRecord) {
        self.steps.push(record);
        self.updated_at = Utc::now();
    }

    pub fn finish(&mut self, reason: TerminationReason, detail: impl Into<String>) {
        self.outcome = Some(SessionResult {
            reason,
            detail: detail.into(),
        });
        self.updated_at = Utc::now();
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Summary of a session for listing
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub agent_id: String,
    pub task: String,
    pub created_at: DateTime<Utc>,
    pub steps: usize,
    pub reason: Option<TerminationReason>,
}

/// Session files under one directory
pub struct SessionStore {
    base_dir: PathBuf,
    /// Sessions still running, keyed by id
    active: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn save(&self, session: &Session) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(self.session_path(&session.id), json)
    }

    pub fn load(&self, session_id: &str) -> std::io::Result<Session> {
        Self::load_from_path(&self.session_path(session_id))
    }

    /// All sessions on disk, newest first
    pub fn list(&self) -> std::io::Result<Vec<SessionSummary>> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Ok(session) = Self::load_from_path(&path) {
                    sessions.push(SessionSummary {
                        id: session.id,
                        agent_id: session.agent_id,
                        task: truncate(&session.task, 50),
                        created_at: session.created_at,
                        steps: session.steps.len(),
                        reason: session.outcome.map(|o| o.reason),
                    });
                }
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    pub fn delete(&self, session_id: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.session_path(session_id))
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", session_id))
    }

    fn load_from_path(path: &Path) -> std::io::Result<Session> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    async fn write(&self, session: Session) {
        let path = self.session_path(&session.id);
        let json = match serde_json::to_string_pretty(&session) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "failed to serialize session");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&path, json).await {
            tracing::warn!(session_id = %session.id, path = %path.display(), error = %e, "failed to write session file");
        }
    }
}

#[async_trait]
impl StepSink for SessionStore {
    async fn session_started(&self, session_id: &str, agent_id: &str, task: &str) {
        let session = Session::new(session_id, agent_id, task);
        self.active.lock().insert(session_id.to_string(), session.clone());
        self.write(session).await;
    }

    async fn record_step(&self, session_id: &str, record: &StepRecord) {
        let snapshot = {
            let mut active = self.active.lock();
            match active.get_mut(session_id) {
                Some(session) => {
                    session.add_step(record.clone());
                    session.clone()
                }
                None => return,
            }
        };
        self.write(snapshot).await;
    }

    async fn record_outcome(&self, outcome: &SessionOutcome) {
        let mut session = self
            .active
            .lock()
            .remove(&outcome.session_id)
            .unwrap_or_else(|| Session::new(&outcome.session_id, &outcome.agent_id, &outcome.task));
        session.steps = outcome.history.clone();
        session.finish(outcome.reason, &outcome.detail);
        self.write(session).await;
    }
}

/// Truncate to `max_chars` characters, adding an ellipsis
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
