//! Network error types.

use crate::PeerId;
use thiserror::Error;

/// Errors raised by the binary reader.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Not enough bytes left in the buffer.
    ///
    /// Callers reassembling a stream treat this as "wait for more data".
    #[error("Buffer exhausted: needed {needed} bytes, {remaining} remaining")]
    Exhausted { needed: usize, remaining: usize },

    /// A variable-length integer used a longer form than its value requires.
    #[error("Non-canonical varint: prefix 0x{prefix:02x} used for value {value}")]
    NonCanonicalVarint { prefix: u8, value: u64 },

    /// A length-prefixed string was not valid UTF-8.
    #[error("Invalid string: {0}")]
    InvalidString(String),
}

impl CodecError {
    /// Whether more input could make this read succeed.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, CodecError::Exhausted { .. })
    }
}

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Frame magic does not match the configured network.
    #[error("Bad magic: expected 0x{expected:08x}, got 0x{got:08x}")]
    BadMagic { expected: u32, got: u32 },

    /// Declared payload length exceeds the protocol maximum.
    #[error("Frame too large: {size} bytes, max {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Command name does not fit in the 12-byte header field.
    #[error("Command too long: {0:?}")]
    CommandTooLong(String),

    /// A checksum-valid frame whose payload could not be decoded.
    #[error("Malformed {command} payload: {source}")]
    MalformedPayload {
        command: String,
        #[source]
        source: CodecError,
    },

    /// Binary codec error outside of payload decoding.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Peer not found.
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    /// The peer manager task is no longer running.
    #[error("Peer manager stopped")]
    ServiceStopped,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
