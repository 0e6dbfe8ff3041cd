//! Packet model: encryption levels, packet identifiers, and the in-memory
//! packet representation the send loop serializes.

pub mod header;
pub mod number;

use std::fmt;

use crate::frame::Frame;

pub use header::VersionNegotiation;
pub use number::PacketNumberAllocator;

/// Key epoch a packet is protected under. Each level has independent keys
/// and an independent packet-number space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EncryptionLevel {
    /// Initial keys derived from the connection id.
    Initial,
    /// Handshake keys.
    Handshake,
    /// Application (1-RTT) keys.
    Application,
}

impl EncryptionLevel {
    /// All levels, in key-epoch order.
    pub const ALL: [EncryptionLevel; 3] = [
        EncryptionLevel::Initial,
        EncryptionLevel::Handshake,
        EncryptionLevel::Application,
    ];

    /// Dense index for per-level tables.
    pub fn index(self) -> usize {
        match self {
            EncryptionLevel::Initial => 0,
            EncryptionLevel::Handshake => 1,
            EncryptionLevel::Application => 2,
        }
    }
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EncryptionLevel::Initial => "Initial",
            EncryptionLevel::Handshake => "Handshake",
            EncryptionLevel::Application => "Application",
        };
        f.write_str(name)
    }
}

/// Identifies a sent packet: encryption level plus packet number.
///
/// Ordered lexicographically; the ordering is only used for diagnostic
/// reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId {
    /// Encryption level (packet-number space).
    pub level: EncryptionLevel,
    /// Packet number within the level.
    pub packet_number: u64,
}

impl PacketId {
    /// Create a packet id.
    pub fn new(level: EncryptionLevel, packet_number: u64) -> Self {
        Self {
            level,
            packet_number,
        }
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.level, self.packet_number)
    }
}

/// An in-memory packet: a list of frames destined for one encryption level.
///
/// The packet number is assigned by the send loop at emission time; a
/// retransmitted copy starts without one and is numbered afresh.
#[derive(Debug, Clone)]
pub struct QuicPacket {
    level: EncryptionLevel,
    packet_number: Option<u64>,
    frames: Vec<Frame>,
}

impl QuicPacket {
    /// An empty packet for `level`.
    pub fn new(level: EncryptionLevel) -> Self {
        Self {
            level,
            packet_number: None,
            frames: Vec::new(),
        }
    }

    /// A packet pre-populated with `frames`.
    pub fn with_frames(level: EncryptionLevel, frames: Vec<Frame>) -> Self {
        Self {
            level,
            packet_number: None,
            frames,
        }
    }

    /// Encryption level this packet is protected under.
    pub fn level(&self) -> EncryptionLevel {
        self.level
    }

    /// Packet number, once assigned at send time.
    pub fn packet_number(&self) -> Option<u64> {
        self.packet_number
    }

    /// Identifier, once the packet number has been assigned.
    pub fn id(&self) -> Option<PacketId> {
        self.packet_number
            .map(|pn| PacketId::new(self.level, pn))
    }

    /// Frames in the order they will appear on the wire.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Append a frame.
    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Assign the packet number. Called once by the send loop.
    pub(crate) fn set_packet_number(&mut self, packet_number: u64) {
        self.packet_number = Some(packet_number);
    }

    /// Does this packet carry any CRYPTO frame?
    pub fn is_crypto(&self) -> bool {
        self.frames.iter().any(|f| matches!(f, Frame::Crypto(_)))
    }

    /// Does any frame oblige the peer to acknowledge?
    pub fn is_ack_eliciting(&self) -> bool {
        self.frames.iter().any(Frame::is_ack_eliciting)
    }

    /// Concatenated frame encodings (the plaintext payload).
    pub fn payload(&self) -> Result<Vec<u8>, crate::core::error::FrameError> {
        let mut out = Vec::with_capacity(self.payload_len());
        for frame in &self.frames {
            frame.encode_into(&mut out)?;
        }
        Ok(out)
    }

    /// Length of the plaintext payload.
    pub fn payload_len(&self) -> usize {
        self.frames.iter().map(Frame::encoded_len).sum()
    }

    /// A copy for retransmission: same frames, no packet number.
    pub fn deep_copy(&self) -> Self {
        Self {
            level: self.level,
            packet_number: None,
            frames: self.frames.clone(),
        }
    }
}

impl fmt::Display for QuicPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) [",
            self.level,
            self.packet_number
                .map_or_else(|| "-".to_string(), |pn| pn.to_string()),
        )?;
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{frame}")?;
        }
        f.write_str("]")
    }
}
