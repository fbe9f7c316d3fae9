//! Agent loop driving a remote machine through the controller protocol
//!
//! # Architecture
//!
//! ```text
//! task → AgentController ──► OBSERVING: screenshot (+ page elements)
//!             ▲                   │
//!             │                   ▼
//!             │              DECIDING: ReasoningAdapter (local | hosted)
//!             │                   │
//!             │          completion? ──► TERMINATED(success | failure)
//!             │                   ▼
//!             └──────────── ACTING: tool call → Dispatcher → remote executor
//!                                 │
//!                   step == max_steps? ──► TERMINATED(max_steps_exceeded)
//! ```
//!
//! Each step record goes into the bounded [`ContextWindow`] and to the
//! configured [`StepSink`].

pub mod context;
pub mod controller;
pub mod runs;
pub mod session;

pub use context::{ActionOutcome, ContextWindow, Observation, StepRecord, ToolInvocation};
pub use controller::AgentController;
pub use runs::{RunRegistry, RunStatus, RunView};
pub use session::{
    NullSink, Session, SessionOutcome, SessionStore, SessionSummary, StepSink, TerminationReason,
};
