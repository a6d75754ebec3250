//! Core WebSocket infrastructure.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: owns the single live session and the task driving it
//! - `session`: the connection lifecycle as a pure state machine
//! - `reconnect` / `heartbeat` / `topic`: retry policy, keep-alive and the
//!   active group subscription, all consulted by the session
//! - [`Dispatcher`]: routes inbound frames to handlers by message type
//! - [`codec`]: the JSON wire format

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub(crate) mod heartbeat;
pub(crate) mod reconnect;
pub(crate) mod session;
pub(crate) mod topic;

pub use codec::{ControlFrame, Frame, GroupId};
pub use connection::{ConnectionManager, ConnectionState};
pub use dispatcher::{Dispatcher, Handler, StateListener, WILDCARD};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
