//! Sencha - drive remote desktop/browser machines from an AI agent loop
//!
//! A server keeps one persistent WebSocket per remote controller and matches
//! command results back to their callers by correlation id. The agent loop
//! uses that channel to observe, ask a vision model what to do, and act.
//!
//! # Modules
//!
//! - `protocol` - wire frames and command/result envelopes
//! - `controller` - channel registry, pending-request registry, dispatcher, WebSocket endpoint
//! - `executor` - the remote side: reconnecting client plus desktop action executor
//! - `agent` - observe → decide → act loop, context window, session persistence
//! - `backend` - local (Ollama) and hosted (OpenAI-compatible) reasoning backends
//! - `api` - HTTP operations API
//! - `config`, `retry` - typed settings
//! - `metrics`, `telemetry` - Prometheus metrics and tracing setup
//!
//! # Quick Start
//!
//! ```ignore
//! use sencha::controller::{ChannelRegistry, Dispatcher};
//! use sencha::protocol::ActionType;
//!
//! let channels = Arc::new(ChannelRegistry::new());
//! let dispatcher = Dispatcher::new(channels, Duration::from_secs(30));
//! let shot = dispatcher
//!     .dispatch("desk-1", ActionType::Screenshot, Parameters::new(), None)
//!     .await?;
//! ```

pub mod agent;
pub mod api;
pub mod backend;
pub mod config;
pub mod controller;
pub mod executor;
pub mod metrics;
pub mod protocol;
pub mod retry;
pub mod telemetry;

pub use agent::{AgentController, SessionOutcome, TerminationReason};
pub use controller::{ChannelRegistry, DispatchError, Dispatcher};
pub use protocol::{ActionType, CommandEnvelope, ResultEnvelope};
