//! Error types for the quiver send path.

use thiserror::Error;

use crate::packet::{EncryptionLevel, PacketId};

/// Errors raised while encoding or decoding wire formats.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Input ended before the structure was complete.
    #[error("truncated input: needed {needed} more bytes")]
    Truncated {
        /// Additional bytes required.
        needed: usize,
    },

    /// Unknown or unsupported frame type byte.
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u64),

    /// Value exceeds the variable-length integer range.
    #[error("value {0} exceeds varint range")]
    VarintRange(u64),

    /// A field carried an illegal value.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

/// Errors raised by in-flight registry operations.
///
/// Both variants indicate a bug in the caller, never peer behavior.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A record for this packet id already exists.
    #[error("duplicate packet id {0}")]
    DuplicatePacketId(PacketId),

    /// The requested state transition is not allowed for this record.
    #[error("invalid transition for packet id {0}")]
    InvalidTransition(PacketId),
}

/// Errors surfaced on stream reads and writes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The output side was closed; no more bytes can be written.
    #[error("stream {0} is closed for writing")]
    Closed(u64),

    /// The stream was aborted while a reader was blocked on it.
    #[error("stream {0} aborted")]
    Aborted(u64),

    /// No bytes became readable within the configured timeout.
    #[error("read timeout on stream {0} at offset {1}")]
    ReadTimeout(u64, u64),
}

/// Errors raised on the send path.
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection is closed; the request was not queued.
    #[error("connection closed")]
    ConnectionClosed,

    /// The datagram sink failed; fatal to the send task.
    #[error("datagram sink i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialized packet exceeded the maximum packet size.
    #[error("packet of {size} bytes exceeds maximum of {max}")]
    PacketTooLarge {
        /// Serialized packet size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// No keys are installed for the requested encryption level.
    #[error("no keys for encryption level {0:?}")]
    KeysUnavailable(EncryptionLevel),

    /// Payload protection failed.
    #[error("packet protection failed")]
    SealFailed,
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum QuiverError {
    /// Wire codec error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// In-flight registry invariant violation.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Stream read/write error.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Send path error.
    #[error("send error: {0}")]
    Send(#[from] SendError),
}
