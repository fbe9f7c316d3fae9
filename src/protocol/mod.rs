//! Controller wire protocol
//!
//! Every message exchanged between the server and a remote controller is a
//! JSON text frame carrying a `type` discriminator:
//!
//! ```text
//! controller                              server
//!     │ ── handshake {api_key, system_info} ──► │
//!     │ ◄── handshake_ack {status, machine_id} ─ │
//!     │ ◄── command {correlation_id, action} ─── │  (dispatcher)
//!     │ ── result {correlation_id, status} ────► │  (pending registry)
//!     │ ◄── ping / pong ───────────────────────► │  (heartbeat)
//! ```

pub mod messages;

pub use messages::{
    AckStatus, ActionType, CommandEnvelope, ErrorCode, Frame, Parameters, ProtocolError,
    ResultEnvelope, ResultStatus, Screenshot,
};

/// Maximum inbound frame size accepted on either side (screenshots are large)
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// WebSocket path the remote controller connects to
pub const CONTROLLER_WS_PATH: &str = "/ws/controller";
