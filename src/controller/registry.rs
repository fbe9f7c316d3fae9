//! Pending-request registry
//!
//! Maps a correlation id to the single caller waiting for its reply. Each
//! entry is a one-shot sender; it is removed on resolve, expire or close, so
//! a reply can reach its waiter at most once and late replies find nothing.
//!
//! ```text
//! register(id) ──► [id → oneshot::Sender]  ◄── resolve(id, result)
//!      │                    │                     (removes + sends)
//!      ▼                    └── expire(id) / close(detail)
//! PendingReply (await)
//! ```
//!
//! The map lock is held only while inserting or removing entries.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::error::RegistryError;
use crate::metrics::{LATE_REPLIES_DROPPED, PENDING_COMMANDS};
use crate::protocol::ResultEnvelope;

/// Waitable handle returned by [`PendingRegistry::register`]
///
/// Dropping the handle before a reply arrives expires its entry, so a caller
/// that goes away (aborted task, dropped request future) leaves nothing
/// behind in the registry.
pub struct PendingReply<'a> {
    registry: &'a PendingRegistry,
    correlation_id: String,
    rx: oneshot::Receiver<ResultEnvelope>,
}

impl PendingReply<'_> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the reply
    ///
    /// Returns `None` when the entry was expired without a result.
    pub async fn wait(mut self) -> Option<ResultEnvelope> {
        (&mut self.rx).await.ok()
    }

    /// Non-blocking poll (used by tests and diagnostics)
    pub fn try_take(&mut self) -> Option<ResultEnvelope> {
        self.rx.try_recv().ok()
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        // Closing first lets the registry tell this entry apart from a newer
        // registration that reused the id
        self.rx.close();
        self.registry.expire_abandoned(&self.correlation_id);
    }
}

impl std::fmt::Debug for PendingReply<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

#[derive(Default)]
struct Inner {
    waiters: HashMap<String, oneshot::Sender<ResultEnvelope>>,
    closed: Option<String>,
}

/// Correlation id → waiter map for one agent connection
#[derive(Default)]
pub struct PendingRegistry {
    inner: Mutex<Inner>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `correlation_id`
    ///
    /// Fails if the id already has a live waiter or the registry was closed.
    pub fn register(&self, correlation_id: &str) -> Result<PendingReply<'_>, RegistryError> {
        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.closed {
            return Err(RegistryError::Closed(reason.clone()));
        }
        if inner.waiters.contains_key(correlation_id) {
            return Err(RegistryError::Duplicate(correlation_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(correlation_id.to_string(), tx);
        PENDING_COMMANDS.inc();
        Ok(PendingReply {
            registry: self,
            correlation_id: correlation_id.to_string(),
            rx,
        })
    }

    /// Deliver `result` to the waiter for `correlation_id`
    ///
    /// Returns whether a waiter existed. A second resolve for the same id, or
    /// a resolve after expiry, is a no-op returning false.
    pub fn resolve(&self, correlation_id: &str, result: ResultEnvelope) -> bool {
        let sender = self.inner.lock().waiters.remove(correlation_id);
        match sender {
            Some(tx) => {
                PENDING_COMMANDS.dec();
                // Receiver gone means the caller stopped waiting
                tx.send(result).is_ok()
            }
            None => {
                LATE_REPLIES_DROPPED.inc();
                tracing::debug!(correlation_id, "dropping reply with no pending waiter");
                false
            }
        }
    }

    /// Remove the entry for `correlation_id` without delivering anything
    pub fn expire(&self, correlation_id: &str) {
        if self.inner.lock().waiters.remove(correlation_id).is_some() {
            PENDING_COMMANDS.dec();
        }
    }

    /// Remove the entry for `correlation_id` if its waiter has gone away
    fn expire_abandoned(&self, correlation_id: &str) {
        let mut inner = self.inner.lock();
        let abandoned = inner
            .waiters
            .get(correlation_id)
            .is_some_and(|tx| tx.is_closed());
        if abandoned {
            inner.waiters.remove(correlation_id);
            PENDING_COMMANDS.dec();
            tracing::debug!(correlation_id, "waiter dropped, expired pending entry");
        }
    }

    /// Resolve every pending entry with an error and refuse new registrations
    ///
    /// Returns the number of waiters that were failed.
    pub fn close(&self, detail: &str) -> usize {
        let drained: Vec<(String, oneshot::Sender<ResultEnvelope>)> = {
            let mut inner = self.inner.lock();
            if inner.closed.is_none() {
                inner.closed = Some(detail.to_string());
            }
            inner.waiters.drain().collect()
        };

        let count = drained.len();
        PENDING_COMMANDS.sub(count as f64);
        for (correlation_id, tx) in drained {
            let _ = tx.send(ResultEnvelope::error(correlation_id, detail));
        }
        count
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.inner.lock().waiters.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }
}
