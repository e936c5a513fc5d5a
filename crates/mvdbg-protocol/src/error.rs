//! Protocol and encoding errors.

use smol_str::SmolStr;
use thiserror::Error;

/// Faults raised while decoding wire data received from a VM.
///
/// These are recoverable: the offending line or payload is rejected and the
/// stream keeps going.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Hex text with an odd number of digits.
    #[error("odd-length hex payload ({0} digits)")]
    OddHexLength(usize),

    /// A character outside `[0-9a-fA-F]`.
    #[error("invalid hex digit {0:?}")]
    InvalidHexDigit(char),

    /// Payload ended before a fixed-width field was complete.
    #[error("unexpected end of payload")]
    UnexpectedEof,

    /// A call-stack frame with an unknown type tag.
    #[error("invalid frame type tag 0x{0:02x}")]
    InvalidFrameType(u8),

    /// A state section with an unknown tag.
    #[error("unknown state section 0x{0:02x}")]
    UnknownStateSection(u8),

    /// Declared payload length disagrees with the actual payload.
    #[error("declared payload length {declared} does not match actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// An address field that is empty or not a number.
    #[error("invalid address '{0}'")]
    InvalidAddress(SmolStr),

    /// A dump reply that could not be parsed.
    #[error("malformed dump: {0}")]
    MalformedDump(SmolStr),

    /// A snapshot chunk line that does not follow the chunk format.
    #[error("invalid snapshot chunk: {0}")]
    InvalidChunk(SmolStr),

    /// A source-map document that does not follow the expected shape.
    #[error("malformed source map: {0}")]
    MalformedSourceMap(SmolStr),

    /// A LEB128 value wider than 64 bits.
    #[error("LEB128 value overflows 64 bits")]
    Leb128Overflow,

    /// A fixed-width field wider than 64 bits.
    #[error("fixed-width field of {0} bytes is wider than 64 bits")]
    ValueTooWide(usize),
}

/// Faults raised while serializing state for transfer.
///
/// These indicate a programming or configuration error (for example a
/// message size ceiling that is too small) and fail the whole serialize
/// call, never truncating output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// A sealed message would exceed the configured ceiling.
    #[error("wire message of {needed} bytes exceeds the maximum message size {max}")]
    MessageTooLarge { needed: usize, max: usize },

    /// A single indivisible fragment cannot fit in any message.
    #[error(
        "state fragment of {fragment} bytes cannot fit the {capacity}-byte payload \
         capacity of a {max}-byte message"
    )]
    FragmentTooLarge {
        fragment: usize,
        capacity: usize,
        max: usize,
    },

    /// A frame whose optional field does not agree with its type tag.
    #[error("frame field mismatch: {0}")]
    FrameFieldMismatch(SmolStr),
}
