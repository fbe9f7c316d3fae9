//! Command channel registry
//!
//! One [`AgentConnection`] per machine id. The most recent connection owns the
//! machine: connecting again supersedes (and closes) the previous one, failing
//! whatever it still had pending. Closing a connection also cancels its token
//! so the socket tasks in [`super::server`] shut down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::DispatchError;
use super::registry::PendingRegistry;
use crate::metrics::{CHANNEL_EVENTS, CONNECTED_AGENTS};
use crate::protocol::{CommandEnvelope, Frame, ResultEnvelope};

/// Observable state of an agent connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// Connected with at least one command in flight
    Busy,
}

/// A live channel to one remote controller
pub struct AgentConnection {
    machine_id: String,
    connection_id: Uuid,
    connected_at: DateTime<Utc>,
    system_info: serde_json::Map<String, Value>,
    outbound: mpsc::Sender<Frame>,
    pending: PendingRegistry,
    last_seen: Mutex<Instant>,
    in_flight: AtomicUsize,
    closed: CancellationToken,
}

impl AgentConnection {
    fn new(
        machine_id: String,
        outbound: mpsc::Sender<Frame>,
        system_info: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            machine_id,
            connection_id: Uuid::now_v7(),
            connected_at: Utc::now(),
            system_info,
            outbound,
            pending: PendingRegistry::new(),
            last_seen: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn pending(&self) -> &PendingRegistry {
        &self.pending
    }

    /// Cancelled once the connection is closed for any reason
    pub fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Disconnected
        } else if self.in_flight.load(Ordering::Relaxed) > 0 {
            ConnectionState::Busy
        } else {
            ConnectionState::Connected
        }
    }

    /// Refresh the heartbeat timestamp
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Queue a frame for the socket writer
    pub async fn send(&self, frame: Frame) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(self.not_found());
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| self.not_found())
    }

    /// Queue a frame without waiting for buffer space
    ///
    /// Used from the socket reader, which must not stall on a full queue.
    pub fn try_send(&self, frame: Frame) -> bool {
        !self.is_closed() && self.outbound.try_send(frame).is_ok()
    }

    /// Route an inbound result to its waiter
    ///
    /// Returns whether a pending command was resolved.
    pub fn on_receive(&self, result: ResultEnvelope) -> bool {
        self.touch();
        let correlation_id = result.correlation_id.clone();
        self.pending.resolve(&correlation_id, result.normalize())
    }

    /// Mark a command in flight until the returned guard drops
    pub fn begin_command(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { conn: self }
    }

    /// Fail every pending command and stop the socket tasks
    pub fn close(&self, reason: &str) -> usize {
        self.closed.cancel();
        self.pending.close(reason)
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            machine_id: self.machine_id.clone(),
            connection_id: self.connection_id.to_string(),
            state: self.state(),
            connected_at: self.connected_at,
            last_seen_secs: self.idle_for().as_secs_f64(),
            pending_commands: self.pending.len(),
            system_info: self.system_info.clone(),
        }
    }

    fn not_found(&self) -> DispatchError {
        DispatchError::ChannelNotFound {
            agent_id: self.machine_id.clone(),
        }
    }
}

/// Decrements the in-flight count on drop
pub struct InFlightGuard<'a> {
    conn: &'a AgentConnection,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.conn.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Snapshot of a connection for the operations API
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub machine_id: String,
    pub connection_id: String,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
    pub last_seen_secs: f64,
    pub pending_commands: usize,
    pub system_info: serde_json::Map<String, Value>,
}

/// Machine id → live connection
#[derive(Default)]
pub struct ChannelRegistry {
    connections: RwLock<HashMap<String, Arc<AgentConnection>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly authenticated connection for `machine_id`
    ///
    /// Any previous connection for the same machine is closed and its pending
    /// commands fail.
    pub fn connect(
        &self,
        machine_id: &str,
        outbound: mpsc::Sender<Frame>,
        system_info: serde_json::Map<String, Value>,
    ) -> Arc<AgentConnection> {
        let conn = Arc::new(AgentConnection::new(
            machine_id.to_string(),
            outbound,
            system_info,
        ));

        let previous = {
            let mut connections = self.connections.write();
            let previous = connections.insert(machine_id.to_string(), conn.clone());
            CONNECTED_AGENTS.set(connections.len() as f64);
            previous
        };

        CHANNEL_EVENTS.with_label_values(&["connected"]).inc();
        if let Some(old) = previous {
            let failed = old.close("connection superseded by a reconnect");
            CHANNEL_EVENTS.with_label_values(&["superseded"]).inc();
            tracing::warn!(
                machine_id,
                old_connection = %old.connection_id(),
                failed_pending = failed,
                "controller reconnected, superseding previous channel"
            );
        }

        tracing::info!(machine_id, connection_id = %conn.connection_id(), "controller channel established");
        conn
    }

    /// Close `conn` and unregister it if it still owns its machine id
    pub fn disconnect(&self, conn: &AgentConnection, reason: &str) {
        {
            let mut connections = self.connections.write();
            let owns_slot = connections
                .get(conn.machine_id())
                .is_some_and(|current| current.connection_id() == conn.connection_id());
            if owns_slot {
                connections.remove(conn.machine_id());
            }
            CONNECTED_AGENTS.set(connections.len() as f64);
        }

        if !conn.is_closed() {
            CHANNEL_EVENTS.with_label_values(&["closed"]).inc();
        }
        let failed = conn.close(reason);
        tracing::info!(
            machine_id = conn.machine_id(),
            connection_id = %conn.connection_id(),
            failed_pending = failed,
            reason,
            "controller channel closed"
        );
    }

    pub fn get(&self, machine_id: &str) -> Option<Arc<AgentConnection>> {
        self.connections.read().get(machine_id).cloned()
    }

    /// Fire a command at `machine_id` without waiting for its reply
    pub async fn send(&self, machine_id: &str, command: CommandEnvelope) -> Result<(), DispatchError> {
        let conn = self.get(machine_id).ok_or_else(|| DispatchError::ChannelNotFound {
            agent_id: machine_id.to_string(),
        })?;
        conn.send(Frame::Command(command)).await
    }

    /// Deliver an inbound result for `machine_id`
    pub fn on_receive(&self, machine_id: &str, result: ResultEnvelope) -> bool {
        match self.get(machine_id) {
            Some(conn) => conn.on_receive(result),
            None => {
                tracing::debug!(machine_id, correlation_id = %result.correlation_id, "result for unknown channel dropped");
                false
            }
        }
    }

    /// Close every connection idle for longer than `heartbeat_timeout`
    pub fn reap_stale(&self, heartbeat_timeout: Duration) -> Vec<String> {
        let stale: Vec<Arc<AgentConnection>> = self
            .connections
            .read()
            .values()
            .filter(|conn| conn.idle_for() > heartbeat_timeout)
            .cloned()
            .collect();

        stale
            .into_iter()
            .map(|conn| {
                CHANNEL_EVENTS.with_label_values(&["heartbeat_timeout"]).inc();
                tracing::warn!(
                    machine_id = conn.machine_id(),
                    idle_secs = conn.idle_for().as_secs(),
                    "controller heartbeat timed out"
                );
                self.disconnect(&conn, "heartbeat timeout");
                conn.machine_id().to_string()
            })
            .collect()
    }

    /// Periodically reap stale connections until `shutdown` fires
    pub fn spawn_heartbeat_monitor(
        self: Arc<Self>,
        check_interval: Duration,
        heartbeat_timeout: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.reap_stale(heartbeat_timeout);
                    }
                }
            }
        })
    }

    /// Close all connections (server shutdown)
    pub fn close_all(&self, reason: &str) {
        let all: Vec<Arc<AgentConnection>> = self.connections.read().values().cloned().collect();
        for conn in all {
            self.disconnect(&conn, reason);
        }
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .connections
            .read()
            .values()
            .map(|conn| conn.info())
            .collect();
        infos.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        infos
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ActionType, Parameters, ResultStatus};
    use serde_json::json;

    fn connect(registry: &ChannelRegistry, id: &str) -> (Arc<AgentConnection>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        (registry.connect(id, tx, Default::default()), rx)
    }

    #[tokio::test]
    async fn test_send_reaches_outbound_queue() {
        let registry = ChannelRegistry::new();
        let (_conn, mut rx) = connect(&registry, "m1");

        let command = CommandEnvelope::new(ActionType::Screenshot, Parameters::new());
        registry.send("m1", command.clone()).await.unwrap();

        assert_eq!(rx.recv().await, Some(Frame::Command(command)));
    }

    #[tokio::test]
    async fn test_send_to_unknown_agent_fails() {
        let registry = ChannelRegistry::new();
        let command = CommandEnvelope::new(ActionType::Screenshot, Parameters::new());
        assert!(matches!(
            registry.send("ghost", command).await,
            Err(DispatchError::ChannelNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_and_fails_pending() {
        let registry = ChannelRegistry::new();
        let (old, _old_rx) = connect(&registry, "m1");
        let reply = old.pending().register("c1").unwrap();

        let (new, _new_rx) = connect(&registry, "m1");

        assert!(old.is_closed());
        assert_eq!(old.state(), ConnectionState::Disconnected);
        let result = reply.wait().await.unwrap();
        assert_eq!(result.status, ResultStatus::Error);

        let current = registry.get("m1").unwrap();
        assert_eq!(current.connection_id(), new.connection_id());
    }

    #[tokio::test]
    async fn test_stale_disconnect_does_not_evict_newer_connection() {
        let registry = ChannelRegistry::new();
        let (old, _old_rx) = connect(&registry, "m1");
        let (new, _new_rx) = connect(&registry, "m1");

        registry.disconnect(&old, "socket closed");

        assert_eq!(registry.get("m1").unwrap().connection_id(), new.connection_id());
        assert!(!new.is_closed());
    }

    #[tokio::test]
    async fn test_on_receive_resolves_pending() {
        let registry = ChannelRegistry::new();
        let (conn, _rx) = connect(&registry, "m1");
        let reply = conn.pending().register("c1").unwrap();

        assert!(registry.on_receive("m1", ResultEnvelope::ok("c1", json!({"clicked": true}))));
        assert_eq!(reply.wait().await.unwrap().payload, json!({"clicked": true}));
        assert!(!registry.on_receive("m1", ResultEnvelope::ok("c1", json!(null))));
    }

    #[tokio::test]
    async fn test_busy_while_command_in_flight() {
        let registry = ChannelRegistry::new();
        let (conn, _rx) = connect(&registry, "m1");
        assert_eq!(conn.state(), ConnectionState::Connected);
        {
            let _guard = conn.begin_command();
            assert_eq!(conn.state(), ConnectionState::Busy);
        }
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_stale_closes_idle_connections() {
        let registry = ChannelRegistry::new();
        let (idle, _idle_rx) = connect(&registry, "idle");
        let reply = idle.pending().register("c1").unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        let (fresh, _fresh_rx) = connect(&registry, "fresh");

        let reaped = registry.reap_stale(Duration::from_secs(10));
        assert_eq!(reaped, vec!["idle".to_string()]);
        assert!(registry.get("idle").is_none());
        assert!(!fresh.is_closed());
        assert_eq!(reply.wait().await.unwrap().status, ResultStatus::Error);
    }
}
