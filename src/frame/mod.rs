//! Frame model and wire codec.
//!
//! Frames are owned values: a frame carries its fields, knows its on-wire
//! encoding and its encoded length. Dispatch over frame kinds is pattern
//! matching on [`Frame`].
//!
//! The send path only ever *produces* most of these; decoding is provided
//! for ACK frames (which this core consumes) and for the rest so encodings
//! can be verified by round-trip.

use std::fmt;
use std::time::Duration;

use crate::core::constants::*;
use crate::core::error::FrameError;
use crate::varint::{read_varint, varint_size, write_varint};

/// An acknowledgement range beyond the first: `gap` unacknowledged packet
/// numbers, then `length + 1` acknowledged ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRange {
    /// Unacknowledged gap below the previous range.
    pub gap: u64,
    /// Extent of this acknowledged range (number of packets minus one).
    pub length: u64,
}

/// ACK frame contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    /// Largest packet number being acknowledged.
    pub largest_acknowledged: u64,
    /// Ack delay in wire units (microseconds >> ack-delay exponent).
    pub ack_delay_raw: u64,
    /// Extent of the first range below `largest_acknowledged`.
    pub first_range: u64,
    /// Additional gap/range pairs, descending.
    pub ranges: Vec<AckRange>,
}

impl AckFrame {
    /// An ACK covering exactly one packet number.
    pub fn for_packet(packet_number: u64) -> Self {
        Self {
            largest_acknowledged: packet_number,
            ack_delay_raw: 0,
            first_range: 0,
            ranges: Vec::new(),
        }
    }

    /// The peer-reported ack delay, unscaled to wall-clock time.
    pub fn ack_delay(&self) -> Duration {
        Duration::from_micros(self.ack_delay_raw << ACK_DELAY_EXPONENT)
    }

    /// All packet numbers this frame acknowledges, descending.
    pub fn acked_packet_numbers(&self) -> Vec<u64> {
        let mut acked = Vec::new();
        let mut largest = self.largest_acknowledged;
        let mut smallest = largest.saturating_sub(self.first_range);
        for pn in (smallest..=largest).rev() {
            acked.push(pn);
        }
        for range in &self.ranges {
            // The next range's largest sits gap + 2 below the previous
            // range's smallest.
            if smallest < range.gap + 2 {
                break;
            }
            largest = smallest - range.gap - 2;
            smallest = largest.saturating_sub(range.length);
            for pn in (smallest..=largest).rev() {
                acked.push(pn);
            }
        }
        acked
    }
}

/// STREAM frame contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// Stream identifier.
    pub stream_id: u64,
    /// Offset of the first byte of `data` within the stream.
    pub offset: u64,
    /// Application bytes.
    pub data: Vec<u8>,
    /// Final frame of the stream.
    pub fin: bool,
}

impl StreamFrame {
    /// Offset one past the last byte this frame carries.
    pub fn up_to_offset(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    /// Wire overhead of a STREAM frame at `offset` for `stream_id`: type
    /// byte, stream id, offset, the length field, and one byte of
    /// headroom for the length varint widening past 63.
    pub fn header_overhead(stream_id: u64, offset: u64) -> usize {
        1 + varint_size(stream_id) + varint_size(offset) + 1 + 1
    }
}

/// CRYPTO frame contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    /// Offset within the handshake byte stream.
    pub offset: u64,
    /// Handshake bytes.
    pub data: Vec<u8>,
}

/// CONNECTION_CLOSE frame contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    /// Transport error code.
    pub error_code: u16,
    /// Type of the frame that triggered the close, 0 if none.
    pub frame_type: u64,
    /// Human-readable reason phrase.
    pub reason: String,
}

/// The frames this send core produces or consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Single padding byte.
    Padding,
    /// PING; elicits an acknowledgement.
    Ping,
    /// Acknowledgement.
    Ack(AckFrame),
    /// Handshake bytes.
    Crypto(CryptoFrame),
    /// Application stream bytes.
    Stream(StreamFrame),
    /// Connection-level flow control limit.
    MaxData(u64),
    /// Per-stream flow control limit.
    MaxStreamData {
        /// Stream identifier.
        stream_id: u64,
        /// New receive limit.
        limit: u64,
    },
    /// Ask the peer to stop sending on a stream.
    StopSending {
        /// Stream identifier.
        stream_id: u64,
        /// Application error code.
        error_code: u16,
    },
    /// Terminate the connection.
    ConnectionClose(ConnectionCloseFrame),
}

impl Frame {
    /// Whether this frame obliges the peer to send an acknowledgement.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Ack(_) | Frame::Padding | Frame::ConnectionClose(_)
        )
    }

    /// Serialized length in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Padding => 1,
            Frame::Ping => 1,
            Frame::Ack(ack) => {
                let mut len = varint_size(FRAME_TYPE_ACK)
                    + varint_size(ack.largest_acknowledged)
                    + varint_size(ack.ack_delay_raw)
                    + varint_size(ack.ranges.len() as u64)
                    + varint_size(ack.first_range);
                for range in &ack.ranges {
                    len += varint_size(range.gap) + varint_size(range.length);
                }
                len
            }
            Frame::Crypto(crypto) => {
                varint_size(FRAME_TYPE_CRYPTO)
                    + varint_size(crypto.offset)
                    + varint_size(crypto.data.len() as u64)
                    + crypto.data.len()
            }
            Frame::Stream(stream) => {
                1 + varint_size(stream.stream_id)
                    + varint_size(stream.offset)
                    + varint_size(stream.data.len() as u64)
                    + stream.data.len()
            }
            Frame::MaxData(limit) => varint_size(FRAME_TYPE_MAX_DATA) + varint_size(*limit),
            Frame::MaxStreamData { stream_id, limit } => {
                varint_size(FRAME_TYPE_MAX_STREAM_DATA)
                    + varint_size(*stream_id)
                    + varint_size(*limit)
            }
            Frame::StopSending { stream_id, .. } => {
                varint_size(FRAME_TYPE_STOP_SENDING) + varint_size(*stream_id) + 2
            }
            Frame::ConnectionClose(close) => {
                varint_size(FRAME_TYPE_CONNECTION_CLOSE)
                    + 2
                    + varint_size(close.frame_type)
                    + varint_size(close.reason.len() as u64)
                    + close.reason.len()
            }
        }
    }

    /// Append the wire encoding of this frame to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), FrameError> {
        match self {
            Frame::Padding => out.push(FRAME_TYPE_PADDING as u8),
            Frame::Ping => out.push(FRAME_TYPE_PING as u8),
            Frame::Ack(ack) => {
                write_varint(FRAME_TYPE_ACK, out)?;
                write_varint(ack.largest_acknowledged, out)?;
                write_varint(ack.ack_delay_raw, out)?;
                write_varint(ack.ranges.len() as u64, out)?;
                write_varint(ack.first_range, out)?;
                for range in &ack.ranges {
                    write_varint(range.gap, out)?;
                    write_varint(range.length, out)?;
                }
            }
            Frame::Crypto(crypto) => {
                write_varint(FRAME_TYPE_CRYPTO, out)?;
                write_varint(crypto.offset, out)?;
                write_varint(crypto.data.len() as u64, out)?;
                out.extend_from_slice(&crypto.data);
            }
            Frame::Stream(stream) => {
                let type_byte = FRAME_TYPE_STREAM_BASE
                    | STREAM_BIT_OFFSET
                    | STREAM_BIT_LENGTH
                    | if stream.fin { STREAM_BIT_FIN } else { 0 };
                write_varint(type_byte, out)?;
                write_varint(stream.stream_id, out)?;
                write_varint(stream.offset, out)?;
                write_varint(stream.data.len() as u64, out)?;
                out.extend_from_slice(&stream.data);
            }
            Frame::MaxData(limit) => {
                write_varint(FRAME_TYPE_MAX_DATA, out)?;
                write_varint(*limit, out)?;
            }
            Frame::MaxStreamData { stream_id, limit } => {
                write_varint(FRAME_TYPE_MAX_STREAM_DATA, out)?;
                write_varint(*stream_id, out)?;
                write_varint(*limit, out)?;
            }
            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                write_varint(FRAME_TYPE_STOP_SENDING, out)?;
                write_varint(*stream_id, out)?;
                out.extend_from_slice(&error_code.to_be_bytes());
            }
            Frame::ConnectionClose(close) => {
                write_varint(FRAME_TYPE_CONNECTION_CLOSE, out)?;
                out.extend_from_slice(&close.error_code.to_be_bytes());
                write_varint(close.frame_type, out)?;
                write_varint(close.reason.len() as u64, out)?;
                out.extend_from_slice(close.reason.as_bytes());
            }
        }
        Ok(())
    }

    /// Serialize this frame to a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns the frame and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
        let mut pos = 0;
        let frame_type = read(buf, &mut pos)?;
        let frame = match frame_type {
            FRAME_TYPE_PADDING => Frame::Padding,
            FRAME_TYPE_PING => Frame::Ping,
            FRAME_TYPE_ACK | FRAME_TYPE_ACK_ECN => {
                let largest_acknowledged = read(buf, &mut pos)?;
                let ack_delay_raw = read(buf, &mut pos)?;
                let range_count = read(buf, &mut pos)?;
                let first_range = read(buf, &mut pos)?;
                let mut ranges = Vec::with_capacity(range_count as usize);
                for _ in 0..range_count {
                    let gap = read(buf, &mut pos)?;
                    let length = read(buf, &mut pos)?;
                    ranges.push(AckRange { gap, length });
                }
                if frame_type == FRAME_TYPE_ACK_ECN {
                    // ECN counts are not tracked; consume and discard.
                    for _ in 0..3 {
                        read(buf, &mut pos)?;
                    }
                }
                Frame::Ack(AckFrame {
                    largest_acknowledged,
                    ack_delay_raw,
                    first_range,
                    ranges,
                })
            }
            FRAME_TYPE_CRYPTO => {
                let offset = read(buf, &mut pos)?;
                let length = read(buf, &mut pos)? as usize;
                Frame::Crypto(CryptoFrame {
                    offset,
                    data: read_bytes(buf, &mut pos, length)?.to_vec(),
                })
            }
            // 0x0c sits inside the STREAM type range; STOP_SENDING wins
            // the overlap, so STREAM frames are always encoded with the
            // offset and length bits set.
            FRAME_TYPE_STOP_SENDING => {
                let stream_id = read(buf, &mut pos)?;
                let code = read_bytes(buf, &mut pos, 2)?;
                Frame::StopSending {
                    stream_id,
                    error_code: u16::from_be_bytes([code[0], code[1]]),
                }
            }
            t if (FRAME_TYPE_STREAM_BASE..FRAME_TYPE_STREAM_BASE + 8).contains(&t) => {
                let stream_id = read(buf, &mut pos)?;
                let offset = if t & STREAM_BIT_OFFSET != 0 {
                    read(buf, &mut pos)?
                } else {
                    0
                };
                let data = if t & STREAM_BIT_LENGTH != 0 {
                    let length = read(buf, &mut pos)? as usize;
                    read_bytes(buf, &mut pos, length)?.to_vec()
                } else {
                    let rest = buf[pos..].to_vec();
                    pos = buf.len();
                    rest
                };
                Frame::Stream(StreamFrame {
                    stream_id,
                    offset,
                    data,
                    fin: t & STREAM_BIT_FIN != 0,
                })
            }
            FRAME_TYPE_MAX_DATA => Frame::MaxData(read(buf, &mut pos)?),
            FRAME_TYPE_MAX_STREAM_DATA => {
                let stream_id = read(buf, &mut pos)?;
                let limit = read(buf, &mut pos)?;
                Frame::MaxStreamData { stream_id, limit }
            }
            FRAME_TYPE_CONNECTION_CLOSE => {
                let code = read_bytes(buf, &mut pos, 2)?;
                let error_code = u16::from_be_bytes([code[0], code[1]]);
                let frame_type = read(buf, &mut pos)?;
                let reason_len = read(buf, &mut pos)? as usize;
                let reason = String::from_utf8(read_bytes(buf, &mut pos, reason_len)?.to_vec())
                    .map_err(|_| FrameError::InvalidField("close reason"))?;
                Frame::ConnectionClose(ConnectionCloseFrame {
                    error_code,
                    frame_type,
                    reason,
                })
            }
            other => return Err(FrameError::UnknownType(other)),
        };
        Ok((frame, pos))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Padding => write!(f, "Padding"),
            Frame::Ping => write!(f, "Ping"),
            Frame::Ack(ack) => write!(f, "Ack[{}]", ack.largest_acknowledged),
            Frame::Crypto(c) => write!(f, "Crypto[{},{}]", c.offset, c.data.len()),
            Frame::Stream(s) => write!(
                f,
                "Stream[{},{},{}{}]",
                s.stream_id,
                s.offset,
                s.data.len(),
                if s.fin { ",fin" } else { "" }
            ),
            Frame::MaxData(limit) => write!(f, "MaxData[{limit}]"),
            Frame::MaxStreamData { stream_id, limit } => {
                write!(f, "MaxStreamData[{stream_id}:{limit}]")
            }
            Frame::StopSending {
                stream_id,
                error_code,
            } => write!(f, "StopSending[{stream_id}:{error_code}]"),
            Frame::ConnectionClose(c) => write!(f, "ConnectionClose[{}]", c.error_code),
        }
    }
}

fn read(buf: &[u8], pos: &mut usize) -> Result<u64, FrameError> {
    let (value, consumed) = read_varint(&buf[(*pos).min(buf.len())..])?;
    *pos += consumed;
    Ok(value)
}

fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], FrameError> {
    if buf.len() < *pos + len {
        return Err(FrameError::Truncated {
            needed: *pos + len - buf.len(),
        });
    }
    let slice = &buf[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}
