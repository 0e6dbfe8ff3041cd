//! Transport configuration.
//!
//! All tuning knobs are passed explicitly at construction; nothing is read
//! from globals.

use std::time::Duration;

use super::constants;

/// Tuning knobs for the send path and streams.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum datagram size handed to the sink, in bytes.
    pub max_packet_size: usize,

    /// Initial receiver flow-control limit per stream, in bytes.
    pub initial_max_stream_data: u64,

    /// Initial receiver flow-control limit for the connection, in bytes.
    pub initial_max_data: u64,

    /// How long a stream read may block waiting for bytes.
    /// `None` means wait indefinitely.
    pub read_timeout: Option<Duration>,

    /// Multiplier applied to smoothed RTT for crypto retransmission timers.
    pub crypto_retry_base: u32,

    /// Upper bound on a single congestion-admission wait; the send loop
    /// re-checks admission after each interval so it stays interruptible.
    pub admission_wait: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_packet_size: constants::DEFAULT_MAX_PACKET_SIZE,
            initial_max_stream_data: 262_144,
            initial_max_data: 1_048_576,
            read_timeout: None,
            crypto_retry_base: constants::DEFAULT_CRYPTO_RETRY_BASE,
            admission_wait: Duration::from_millis(100),
        }
    }
}

impl TransportConfig {
    /// Flow-control advertisement increment derived from the initial
    /// per-stream limit.
    pub fn stream_flow_increment(&self) -> u64 {
        (self.initial_max_stream_data as f64 * constants::FLOW_CONTROL_INCREMENT_FACTOR) as u64
    }

    /// Flow-control advertisement increment derived from the initial
    /// connection limit.
    pub fn connection_flow_increment(&self) -> u64 {
        (self.initial_max_data as f64 * constants::FLOW_CONTROL_INCREMENT_FACTOR) as u64
    }
}
