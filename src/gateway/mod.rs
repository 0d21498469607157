//! Gateway side: client connections, sessions and the control plane
//!
//! Network tasks and session receiver threads never touch gateway state
//! directly. They post a [`GatewayEvent`] and the control plane, running on
//! one thread, applies it.

pub mod control;
pub mod mux;
pub mod registry;
pub mod server;
pub mod session;

use std::sync::Weak;

use crate::bus::ConnId;

pub use control::Gateway;
pub use mux::{ClientConnection, ConnectionMux};
pub use registry::SessionRegistry;
pub use server::{WsConnection, WsServer};
pub use session::{session_key, Session, SessionContext, SessionLogin};

pub enum GatewayEvent {
    /// A client connected
    Opened(Weak<dyn ClientConnection>),

    /// A text frame from a client
    Text { conn_id: ConnId, text: String },

    /// A client went away
    Closed { conn_id: ConnId },

    /// A reassembled payload read from a session's outbound channel
    WorkerPayload { key: String, payload: Vec<u8> },

    /// Stop every session and leave the control loop
    Shutdown,
}
