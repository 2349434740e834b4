//! Error types for frame decoding

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while interpreting an inbound frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame did not start with the protocol magic byte
    #[error("unknown magic byte 0x{0:02x}")]
    UnknownMagic(u8),

    /// Frame carried a protocol version this client does not speak
    #[error("unknown protocol version {0}")]
    UnknownVersion(u8),

    /// Command type byte has no decoder
    #[error("unknown command type {0}")]
    UnknownCommand(u8),

    /// Fewer bytes than a full frame were supplied
    #[error("short frame: expected 64 bytes, got {0}")]
    ShortFrame(usize),
}
