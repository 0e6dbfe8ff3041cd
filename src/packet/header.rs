//! Packet header encoding.
//!
//! Initial and Handshake packets use the long header form; Application
//! packets use the short form. Packet numbers are always encoded in four
//! bytes, which keeps the header-protection offsets fixed.

use crate::core::constants::PACKET_NUMBER_SIZE;
use crate::core::error::FrameError;
use crate::varint::write_varint;

use super::EncryptionLevel;

/// Wire version this client speaks.
pub const QUIC_VERSION: u32 = 0x0000_0001;

/// Long-header packet type bits for Initial packets.
const LONG_TYPE_INITIAL: u8 = 0x0;

/// Long-header packet type bits for Handshake packets.
const LONG_TYPE_HANDSHAKE: u8 = 0x2;

/// Connection identifiers carried in packet headers.
#[derive(Debug, Clone, Default)]
pub struct ConnectionIds {
    /// Destination connection id (the peer's).
    pub destination: Vec<u8>,
    /// Source connection id (ours); long headers only.
    pub source: Vec<u8>,
}

/// Header bytes for a packet, plus the offset of the packet-number field
/// (needed for header protection).
#[derive(Debug)]
pub struct EncodedHeader {
    /// Serialized header, packet number included.
    pub bytes: Vec<u8>,
    /// Offset of the first packet-number byte within `bytes`.
    pub pn_offset: usize,
}

/// Serialize the header for a packet at `level` with the given packet
/// number. `remainder_len` is the byte count following the length field:
/// encoded packet number plus ciphertext payload (tag included).
pub fn encode_header(
    level: EncryptionLevel,
    packet_number: u64,
    cids: &ConnectionIds,
    remainder_len: usize,
) -> Result<EncodedHeader, FrameError> {
    let mut bytes = Vec::with_capacity(header_overhead(level, cids));
    match level {
        EncryptionLevel::Initial | EncryptionLevel::Handshake => {
            let type_bits = if level == EncryptionLevel::Initial {
                LONG_TYPE_INITIAL
            } else {
                LONG_TYPE_HANDSHAKE
            };
            bytes.push(0xc0 | (type_bits << 4) | (PACKET_NUMBER_SIZE as u8 - 1));
            bytes.extend_from_slice(&QUIC_VERSION.to_be_bytes());
            bytes.push(cids.destination.len() as u8);
            bytes.extend_from_slice(&cids.destination);
            bytes.push(cids.source.len() as u8);
            bytes.extend_from_slice(&cids.source);
            if level == EncryptionLevel::Initial {
                // Empty token.
                bytes.push(0);
            }
            write_varint(remainder_len as u64, &mut bytes)?;
        }
        EncryptionLevel::Application => {
            bytes.push(0x40 | (PACKET_NUMBER_SIZE as u8 - 1));
            bytes.extend_from_slice(&cids.destination);
        }
    }
    let pn_offset = bytes.len();
    bytes.extend_from_slice(&(packet_number as u32).to_be_bytes());
    Ok(EncodedHeader { bytes, pn_offset })
}

/// Worst-case header size for `level`, packet number included.
///
/// The length field is budgeted at two varint bytes, which covers every
/// packet that fits a normal datagram.
pub fn header_overhead(level: EncryptionLevel, cids: &ConnectionIds) -> usize {
    match level {
        EncryptionLevel::Initial => {
            1 + 4 + 1 + cids.destination.len() + 1 + cids.source.len() + 1 + 2
                + PACKET_NUMBER_SIZE
        }
        EncryptionLevel::Handshake => {
            1 + 4 + 1 + cids.destination.len() + 1 + cids.source.len() + 2 + PACKET_NUMBER_SIZE
        }
        EncryptionLevel::Application => 1 + cids.destination.len() + PACKET_NUMBER_SIZE,
    }
}

/// A parsed Version Negotiation packet.
///
/// Recognized by the long header form with a version field of zero; lists
/// the versions the server supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionNegotiation {
    /// Destination connection id echoed by the server.
    pub destination: Vec<u8>,
    /// Source connection id of the server.
    pub source: Vec<u8>,
    /// Supported 32-bit version numbers.
    pub supported_versions: Vec<u32>,
}

impl VersionNegotiation {
    /// Parse a Version Negotiation packet.
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        let mut pos = 0;
        let first = take(buf, &mut pos, 1)?[0];
        if first & 0x80 == 0 {
            return Err(FrameError::InvalidField("not a long header"));
        }
        let version = u32::from_be_bytes(take(buf, &mut pos, 4)?.try_into().unwrap());
        if version != 0 {
            return Err(FrameError::InvalidField("version field not zero"));
        }

        let dcid_len = take(buf, &mut pos, 1)?[0] as usize;
        let destination = take(buf, &mut pos, dcid_len)?.to_vec();
        let scid_len = take(buf, &mut pos, 1)?[0] as usize;
        let source = take(buf, &mut pos, scid_len)?.to_vec();

        let mut supported_versions = Vec::new();
        while buf.len() - pos >= 4 {
            supported_versions.push(u32::from_be_bytes(
                take(buf, &mut pos, 4)?.try_into().unwrap(),
            ));
        }
        Ok(Self {
            destination,
            source,
            supported_versions,
        })
    }
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], FrameError> {
    if buf.len() < *pos + len {
        return Err(FrameError::Truncated {
            needed: *pos + len - buf.len(),
        });
    }
    let slice = &buf[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}
