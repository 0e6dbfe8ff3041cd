//! Application streams: per-stream output framing and input reassembly.

pub mod flow;
pub mod recv;
pub mod send;

use std::sync::Arc;

use crate::core::config::TransportConfig;
use crate::core::error::StreamError;
use crate::frame::StreamFrame;
use crate::send::Sender;

pub use flow::ConnectionFlow;
pub use recv::StreamInput;
pub use send::{StreamOutput, MIN_STREAM_FRAME_SIZE};

/// Stream-id bit selecting the initiator: 0 = client, 1 = server.
const INITIATOR_BIT: u64 = 0x1;

/// Stream-id bit selecting directionality: 0 = bidirectional, 1 =
/// unidirectional.
const DIRECTION_BIT: u64 = 0x2;

/// A bidirectional application stream: an output half feeding the sender
/// and an input half reassembling received frames.
pub struct QuicStream {
    id: u64,
    output: StreamOutput,
    input: StreamInput,
}

impl QuicStream {
    /// Create stream `id` on top of `sender`, sharing the connection-wide
    /// receive window.
    pub fn new(
        id: u64,
        sender: &Arc<Sender>,
        connection_flow: Arc<ConnectionFlow>,
        config: &TransportConfig,
    ) -> Self {
        Self {
            id,
            output: StreamOutput::new(id, sender),
            input: StreamInput::new(
                id,
                sender,
                connection_flow,
                config.initial_max_stream_data,
                config.stream_flow_increment(),
                config.read_timeout,
            ),
        }
    }

    /// Stream identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Is this a unidirectional stream?
    pub fn is_unidirectional(&self) -> bool {
        self.id & DIRECTION_BIT != 0
    }

    /// Was this stream opened by the client?
    pub fn is_client_initiated(&self) -> bool {
        self.id & INITIATOR_BIT == 0
    }

    /// Client-opened bidirectional stream?
    pub fn is_client_initiated_bidirectional(&self) -> bool {
        self.id & (INITIATOR_BIT | DIRECTION_BIT) == 0
    }

    /// Server-opened bidirectional stream?
    pub fn is_server_initiated_bidirectional(&self) -> bool {
        self.id & (INITIATOR_BIT | DIRECTION_BIT) == INITIATOR_BIT
    }

    /// Append bytes to the send side.
    pub fn write(&self, data: &[u8]) -> Result<(), StreamError> {
        self.output.write(data)
    }

    /// No-op; data is dispatched as soon as the sender allows.
    pub fn flush(&self) -> Result<(), StreamError> {
        self.output.flush()
    }

    /// Close the send side; the last STREAM frame carries FIN.
    pub fn close(&self) {
        self.output.close()
    }

    /// Read contiguously available bytes; see [`StreamInput::read`].
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.input.read(buf).await
    }

    /// Deliver a received STREAM frame to the reassembly buffer.
    pub fn on_stream_frame(&self, frame: StreamFrame) {
        self.input.on_frame(frame)
    }

    /// Abort the stream, waking blocked readers.
    pub fn abort(&self) {
        self.input.abort()
    }

    /// The output half.
    pub fn output(&self) -> &StreamOutput {
        &self.output
    }

    /// The input half.
    pub fn input(&self) -> &StreamInput {
        &self.input
    }
}

impl std::fmt::Debug for QuicStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stream {}", self.id)
    }
}
