//! Session layer of the mvdbg debug bridge.
//!
//! Turns the raw byte stream of one VM connection into correlated
//! request/response pairs and high-level debugging verbs: the line framer,
//! the request/response router, the transport channel, the snapshot
//! timeline and the [`DebugBridge`] orchestrating them. Several bridges run
//! side by side for out-of-place debugging; state moves between them only
//! as [`mvdbg_protocol::RuntimeState`] values.

mod bridge;
mod error;
mod framer;
mod matcher;
mod router;
mod timeline;
mod transport;

#[cfg(test)]
mod tests;

pub use bridge::{BridgeConfig, BridgeEvent, BridgeState, DebugBridge};
pub use error::BridgeError;
pub use framer::MessageFramer;
pub use matcher::LineMatcher;
pub use router::{ReplyHandle, Router};
pub use timeline::Timeline;
pub use transport::{ChannelEvent, Connection, Endpoint, TransportChannel};
