//! Prometheus metrics for the controller channel, dispatcher and agent loop
//!
//! All metrics live in the default registry and are exposed by the server's
//! `/metrics` route via [`gather`].

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec,
    TextEncoder,
};

lazy_static! {
    // ── Command channel ─────────────────────────────────────────────────────
    pub static ref CONNECTED_AGENTS: Gauge = register_gauge!(
        "sencha_connected_agents",
        "Remote controllers with a live channel"
    ).unwrap();

    pub static ref CHANNEL_EVENTS: CounterVec = register_counter_vec!(
        "sencha_channel_events_total",
        "Channel lifecycle events (connected, superseded, closed, heartbeat_timeout, rejected)",
        &["event"]
    ).unwrap();

    pub static ref FRAMES_RECEIVED: CounterVec = register_counter_vec!(
        "sencha_frames_received_total",
        "Inbound frames by type",
        &["kind"]
    ).unwrap();

    // ── Pending registry / dispatcher ──────────────────────────────────────
    pub static ref PENDING_COMMANDS: Gauge = register_gauge!(
        "sencha_pending_commands",
        "Commands awaiting a correlated reply"
    ).unwrap();

    pub static ref LATE_REPLIES_DROPPED: Counter = register_counter!(
        "sencha_late_replies_dropped_total",
        "Results whose correlation id had no pending waiter"
    ).unwrap();

    pub static ref DISPATCHES: CounterVec = register_counter_vec!(
        "sencha_dispatches_total",
        "Dispatcher calls by action and outcome",
        &["action", "outcome"]
    ).unwrap();

    pub static ref DISPATCH_DURATION: HistogramVec = register_histogram_vec!(
        "sencha_dispatch_duration_seconds",
        "Time from send to correlated reply",
        &["action"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    // ── Reasoning backend ──────────────────────────────────────────────────
    pub static ref BACKEND_CALLS: CounterVec = register_counter_vec!(
        "sencha_backend_calls_total",
        "Reasoning backend calls by backend and outcome",
        &["backend", "outcome"]
    ).unwrap();

    pub static ref BACKEND_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "sencha_backend_call_duration_seconds",
        "Reasoning backend request latency",
        &["backend"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // ── Agent loop ─────────────────────────────────────────────────────────
    pub static ref SESSIONS: CounterVec = register_counter_vec!(
        "sencha_sessions_total",
        "Finished agent sessions by termination reason",
        &["reason"]
    ).unwrap();

    pub static ref SESSIONS_RUNNING: Gauge = register_gauge!(
        "sencha_sessions_running",
        "Agent sessions currently executing"
    ).unwrap();

    pub static ref SESSION_STEPS: Histogram = register_histogram!(
        "sencha_session_steps",
        "ACTING phases per finished session",
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 50.0, 100.0]
    ).unwrap();

    pub static ref STEP_RETRIES: CounterVec = register_counter_vec!(
        "sencha_step_retries_total",
        "Dispatch retries inside the agent loop by phase",
        &["phase"]
    ).unwrap();
}

/// Render every registered metric in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
