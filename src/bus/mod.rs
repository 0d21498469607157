//! Message bus between the gateway and its per-user workers
//!
//! Each session owns a channel pair named after its key: `<key>_msg_in`
//! carries client requests to the worker, `<key>_msg_out` carries worker
//! output back.

pub mod channel;
pub mod frame;

pub use channel::ShmChannel;
pub use frame::{decode_inbound, encode_inbound, encode_routed, split_frames, Reassembler, RoutedPayload};

/// Gateway-assigned id of one client connection.
pub type ConnId = u32;

/// Opens a multi-frame payload.
pub const BEGIN_OF_PACKAGE: &str = "BEGIN_OF_PACKAGE";
/// Closes a multi-frame payload.
pub const END_OF_PACKAGE: &str = "END_OF_PACKAGE";
/// Inbound payload telling the worker a client connection went away.
pub const CLOSE_CONNECTION_MSG: &str = "CLOSE_CONNECTION_MSG";

pub fn inbound_name(key: &str) -> String {
    format!("{}_msg_in", key)
}

pub fn outbound_name(key: &str) -> String {
    format!("{}_msg_out", key)
}
