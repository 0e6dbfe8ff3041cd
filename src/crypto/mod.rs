//! Packet protection.
//!
//! Payloads are sealed with ChaCha20-Poly1305 under per-level keys handed
//! over by the TLS collaborator; the packet-number field and the low bits
//! of the first header byte are then masked with a ChaCha20 keystream
//! derived from a ciphertext sample (header protection).

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::Zeroize;

use crate::core::constants::{HEADER_PROTECTION_SAMPLE_SIZE, PACKET_NUMBER_SIZE};
use crate::core::error::SendError;
use crate::packet::header::{encode_header, ConnectionIds};
use crate::packet::EncryptionLevel;

/// AEAD key size.
pub const KEY_SIZE: usize = 32;

/// AEAD IV size.
pub const IV_SIZE: usize = 12;

/// Write-direction keys for one encryption level.
///
/// Key material is zeroized on drop.
#[derive(Clone)]
pub struct PacketKeys {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
    hp: [u8; KEY_SIZE],
}

impl PacketKeys {
    /// Assemble keys from raw material (AEAD key, IV, header-protection key).
    pub fn from_bytes(key: [u8; KEY_SIZE], iv: [u8; IV_SIZE], hp: [u8; KEY_SIZE]) -> Self {
        Self { key, iv, hp }
    }

    /// Per-packet nonce: the IV with the packet number XORed into its tail.
    fn nonce(&self, packet_number: u64) -> [u8; IV_SIZE] {
        let mut nonce = self.iv;
        for (i, byte) in packet_number.to_be_bytes().iter().enumerate() {
            nonce[IV_SIZE - 8 + i] ^= byte;
        }
        nonce
    }
}

impl Drop for PacketKeys {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
        self.hp.zeroize();
    }
}

impl std::fmt::Debug for PacketKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PacketKeys(..)")
    }
}

/// Per-level write keys for the connection.
///
/// Levels without installed keys cannot be sent on; discarded levels
/// behave as if keys were never installed.
#[derive(Debug, Default)]
pub struct ConnectionSecrets {
    keys: [Option<PacketKeys>; 3],
}

impl ConnectionSecrets {
    /// No keys installed yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install write keys for `level`.
    pub fn install(&mut self, level: EncryptionLevel, keys: PacketKeys) {
        self.keys[level.index()] = Some(keys);
    }

    /// Drop the keys for `level` (e.g. once the handshake completes).
    pub fn discard(&mut self, level: EncryptionLevel) {
        self.keys[level.index()] = None;
    }

    /// Keys for `level`, if installed.
    pub fn get(&self, level: EncryptionLevel) -> Option<&PacketKeys> {
        self.keys[level.index()].as_ref()
    }
}

/// Serialize, encrypt and header-protect a packet payload.
///
/// Returns the complete datagram-ready bytes.
pub fn seal_packet(
    secrets: &ConnectionSecrets,
    cids: &ConnectionIds,
    level: EncryptionLevel,
    packet_number: u64,
    payload: &[u8],
) -> Result<Vec<u8>, SendError> {
    let keys = secrets
        .get(level)
        .ok_or(SendError::KeysUnavailable(level))?;

    let remainder_len = PACKET_NUMBER_SIZE + payload.len() + crate::core::constants::AEAD_TAG_SIZE;
    let header = encode_header(level, packet_number, cids, remainder_len)
        .map_err(|_| SendError::SealFailed)?;

    let cipher = ChaCha20Poly1305::new((&keys.key).into());
    let nonce = keys.nonce(packet_number);
    let ciphertext = cipher
        .encrypt(
            (&nonce).into(),
            Payload {
                msg: payload,
                aad: &header.bytes,
            },
        )
        .map_err(|_| SendError::SealFailed)?;

    let pn_offset = header.pn_offset;
    let mut packet = header.bytes;
    packet.extend_from_slice(&ciphertext);

    apply_header_protection(&keys.hp, &mut packet, pn_offset);
    Ok(packet)
}

/// Mask the first byte and the packet-number field in place.
///
/// The mask is a ChaCha20 keystream block: the block counter comes from the
/// first four sample bytes (little endian), the nonce from the remaining
/// twelve. The sample is the first sixteen ciphertext bytes after the
/// packet-number field.
fn apply_header_protection(hp_key: &[u8; KEY_SIZE], packet: &mut [u8], pn_offset: usize) {
    let sample_start = pn_offset + PACKET_NUMBER_SIZE;
    let sample = &packet[sample_start..sample_start + HEADER_PROTECTION_SAMPLE_SIZE];

    let counter = u32::from_le_bytes(sample[..4].try_into().unwrap());
    let nonce: [u8; 12] = sample[4..16].try_into().unwrap();
    let mut cipher = ChaCha20::new(hp_key.into(), (&nonce).into());
    cipher.seek(u64::from(counter) * 64);

    let mut mask = [0u8; 5];
    cipher.apply_keystream(&mut mask);

    let long_header = packet[0] & 0x80 != 0;
    packet[0] ^= mask[0] & if long_header { 0x0f } else { 0x1f };
    for i in 0..PACKET_NUMBER_SIZE {
        packet[pn_offset + i] ^= mask[1 + i];
    }
}
