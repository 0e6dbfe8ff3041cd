//! Protocol constants.
//!
//! Wire-format type identifiers and size constants used across the crate.

// =============================================================================
// FRAME TYPES
// =============================================================================

/// PADDING frame.
pub const FRAME_TYPE_PADDING: u64 = 0x00;

/// PING frame.
pub const FRAME_TYPE_PING: u64 = 0x01;

/// ACK frame.
pub const FRAME_TYPE_ACK: u64 = 0x02;

/// ACK frame with ECN counts.
pub const FRAME_TYPE_ACK_ECN: u64 = 0x03;

/// STREAM frame base type; low three bits encode offset/length/FIN.
pub const FRAME_TYPE_STREAM_BASE: u64 = 0x08;

/// STOP_SENDING frame.
pub const FRAME_TYPE_STOP_SENDING: u64 = 0x0c;

/// MAX_DATA frame.
pub const FRAME_TYPE_MAX_DATA: u64 = 0x10;

/// MAX_STREAM_DATA frame.
pub const FRAME_TYPE_MAX_STREAM_DATA: u64 = 0x11;

/// CRYPTO frame.
pub const FRAME_TYPE_CRYPTO: u64 = 0x18;

/// CONNECTION_CLOSE frame.
pub const FRAME_TYPE_CONNECTION_CLOSE: u64 = 0x1c;

// =============================================================================
// STREAM FRAME TYPE BITS
// =============================================================================

/// STREAM type bit: an explicit offset field is present.
pub const STREAM_BIT_OFFSET: u64 = 0x04;

/// STREAM type bit: an explicit length field is present.
pub const STREAM_BIT_LENGTH: u64 = 0x02;

/// STREAM type bit: this is the final frame of the stream.
pub const STREAM_BIT_FIN: u64 = 0x01;

// =============================================================================
// PACKET SIZES
// =============================================================================

/// Poly1305 authentication tag appended to every protected payload.
pub const AEAD_TAG_SIZE: usize = 16;

/// Packet numbers are encoded in four bytes on the wire.
pub const PACKET_NUMBER_SIZE: usize = 4;

/// Ciphertext sample length used for header protection.
pub const HEADER_PROTECTION_SAMPLE_SIZE: usize = 16;

/// Default maximum datagram size handed to the sink.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1500;

// =============================================================================
// ACK HANDLING
// =============================================================================

/// Default ack-delay exponent: raw ack-delay values on the wire are
/// microseconds shifted right by this amount.
pub const ACK_DELAY_EXPONENT: u32 = 3;

// =============================================================================
// FLOW CONTROL
// =============================================================================

/// A MAX_STREAM_DATA / MAX_DATA update is sent once the consumed delta
/// exceeds this fraction of the initial limit.
pub const FLOW_CONTROL_INCREMENT_FACTOR: f64 = 0.10;

// =============================================================================
// RECOVERY
// =============================================================================

/// Smoothed RTT assumed before the first sample, in milliseconds.
pub const INITIAL_SMOOTHED_RTT_MS: u64 = 100;

/// Multiplier applied to smoothed RTT for crypto retransmission timers.
pub const DEFAULT_CRYPTO_RETRY_BASE: u32 = 2;
