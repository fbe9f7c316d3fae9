//! In-memory registry of agent sessions started through the API
//!
//! Running sessions are always kept. Finished ones are retained for later
//! lookup up to a cap, after which the earliest to finish are forgotten; the
//! session store keeps the durable record.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::controller::AgentController;
use super::session::SessionOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
}

/// Snapshot of a run for API responses
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    pub session_id: String,
    pub agent_id: String,
    pub task: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub outcome: Option<SessionOutcome>,
}

struct RunEntry {
    agent_id: String,
    task: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    outcome: Option<SessionOutcome>,
}

impl RunEntry {
    fn view(&self, session_id: &str) -> RunView {
        RunView {
            session_id: session_id.to_string(),
            agent_id: self.agent_id.clone(),
            task: self.task.clone(),
            status: if self.outcome.is_some() {
                RunStatus::Finished
            } else {
                RunStatus::Running
            },
            started_at: self.started_at,
            outcome: self.outcome.clone(),
        }
    }
}

/// Finished runs kept by [`RunRegistry::new`]
pub const DEFAULT_RETAINED_RUNS: usize = 100;

#[derive(Default)]
struct Runs {
    entries: HashMap<String, RunEntry>,
    /// Finished session ids, earliest first
    finished: VecDeque<String>,
}

pub struct RunRegistry {
    runs: Mutex<Runs>,
    max_finished: usize,
    shutdown: CancellationToken,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_RUNS)
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `max_finished` finished runs
    pub fn with_retention(max_finished: usize) -> Self {
        Self {
            runs: Mutex::default(),
            max_finished,
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn a session on its own task and return its id
    pub fn start(self: &Arc<Self>, controller: Arc<AgentController>, agent_id: &str, task: String) -> String {
        let session_id = Uuid::now_v7().to_string();
        let cancel = self.shutdown.child_token();

        self.runs.lock().entries.insert(
            session_id.clone(),
            RunEntry {
                agent_id: agent_id.to_string(),
                task: task.clone(),
                started_at: Utc::now(),
                cancel: cancel.clone(),
                outcome: None,
            },
        );

        let registry = Arc::clone(self);
        let id = session_id.clone();
        tokio::spawn(async move {
            let outcome = controller.run_session(id.clone(), &task, &cancel).await;
            registry.finish(&id, outcome);
        });

        session_id
    }

    fn finish(&self, session_id: &str, outcome: SessionOutcome) {
        let mut runs = self.runs.lock();
        let Some(entry) = runs.entries.get_mut(session_id) else {
            return;
        };
        entry.outcome = Some(outcome);
        runs.finished.push_back(session_id.to_string());

        while runs.finished.len() > self.max_finished {
            if let Some(evicted) = runs.finished.pop_front() {
                runs.entries.remove(&evicted);
                tracing::debug!(session_id = %evicted, "forgot finished run");
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<RunView> {
        self.runs
            .lock()
            .entries
            .get(session_id)
            .map(|entry| entry.view(session_id))
    }

    /// Newest first
    pub fn list(&self) -> Vec<RunView> {
        let mut views: Vec<RunView> = self
            .runs
            .lock()
            .entries
            .iter()
            .map(|(id, entry)| entry.view(id))
            .collect();
        views.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        views
    }

    /// Request cancellation; returns false for unknown or finished runs
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.runs.lock().entries.get(session_id) {
            Some(entry) if entry.outcome.is_none() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every running session
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::session::TerminationReason;

    fn track(registry: &RunRegistry, session_id: &str) {
        registry.runs.lock().entries.insert(
            session_id.to_string(),
            RunEntry {
                agent_id: "desk-1".to_string(),
                task: "task".to_string(),
                started_at: Utc::now(),
                cancel: registry.shutdown.child_token(),
                outcome: None,
            },
        );
    }

    fn outcome(session_id: &str) -> SessionOutcome {
        let now = Utc::now();
        SessionOutcome {
            session_id: session_id.to_string(),
            agent_id: "desk-1".to_string(),
            task: "task".to_string(),
            reason: TerminationReason::Success,
            detail: "done".to_string(),
            steps: 1,
            history: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_finished_runs_capped_earliest_first() {
        let registry = RunRegistry::with_retention(2);
        for id in ["a", "b", "c", "d"] {
            track(&registry, id);
        }
        registry.finish("b", outcome("b"));
        registry.finish("a", outcome("a"));
        registry.finish("d", outcome("d"));

        // "b" finished first and fell out; "c" is still running
        assert!(registry.get("b").is_none());
        assert_eq!(registry.get("a").unwrap().status, RunStatus::Finished);
        assert_eq!(registry.get("d").unwrap().status, RunStatus::Finished);
        assert_eq!(registry.get("c").unwrap().status, RunStatus::Running);
        assert_eq!(registry.list().len(), 3);
    }

    #[test]
    fn test_running_runs_never_evicted() {
        let registry = RunRegistry::with_retention(0);
        track(&registry, "live");
        track(&registry, "done");
        registry.finish("done", outcome("done"));

        assert!(registry.get("done").is_none());
        assert!(registry.cancel("live"));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_finishing_unknown_run_is_ignored() {
        let registry = RunRegistry::with_retention(1);
        registry.finish("ghost", outcome("ghost"));
        assert!(registry.list().is_empty());
        assert!(registry.runs.lock().finished.is_empty());
    }
}
