//! Server side of the controller protocol
//!
//! - [`registry`]: correlation id → waiter map per connection
//! - [`channel`]: live connections keyed by machine id
//! - [`dispatcher`]: send-and-wait on top of the two
//! - [`server`]: the `/ws/controller` WebSocket endpoint
//! - [`auth`]: handshake authentication seam

pub mod auth;
pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod server;

pub use auth::{AuthVerdict, Authenticator, HandshakeRequest, StaticKeyAuthenticator};
pub use channel::{AgentConnection, ChannelRegistry, ConnectionInfo, ConnectionState};
pub use dispatcher::{AgentHandle, CommandTarget, Dispatcher};
pub use error::{DispatchError, RegistryError};
pub use registry::{PendingRegistry, PendingReply};
pub use server::{ChannelSettings, ControllerState};
