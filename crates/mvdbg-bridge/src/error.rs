//! Session errors.

use smol_str::SmolStr;
use thiserror::Error;

use mvdbg_protocol::{EncodeError, ProtocolError};

/// Faults surfaced by the session layer.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No live connection behind this bridge.
    #[error("not connected")]
    NotConnected,

    /// The connection went away; outstanding requests were failed.
    #[error("disconnected")]
    Disconnected,

    /// A reply did not arrive within the caller's deadline. The router
    /// itself never times out; this comes from an explicit wait deadline.
    #[error("timed out waiting for a reply")]
    Timeout,

    /// An endpoint string that is neither `tcp://` nor `serial://`.
    #[error("unsupported endpoint '{0}'")]
    InvalidEndpoint(SmolStr),

    /// A lock was poisoned by a panicking thread.
    #[error("session state poisoned")]
    Poisoned,

    /// The bridge is in the wrong state for the requested verb.
    #[error("invalid state for this operation: {0}")]
    InvalidState(SmolStr),

    /// No code address is mapped to the requested source line.
    #[error("no code address mapped to source line {0}")]
    UnmappedLine(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}
