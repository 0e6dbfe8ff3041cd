//! In-flight packet registry.
//!
//! One record per sent packet, keyed by [`PacketId`]. Records are created
//! when the datagram leaves the sink, mutated only through registry
//! operations (acked by the ACK processor, resent by the retransmission
//! paths), and retained for statistics until shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::core::error::RegistryError;
use crate::frame::Frame;
use crate::packet::{PacketId, QuicPacket};

use super::LostFrameHandler;

/// Terminal / non-terminal state of a sent packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// Still awaiting acknowledgement.
    InFlight,
    /// Acknowledged by the peer.
    Acked,
    /// Declared lost and re-queued.
    Resent,
}

impl std::fmt::Display for PacketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PacketStatus::InFlight => "-",
            PacketStatus::Acked => "Acked",
            PacketStatus::Resent => "Resent",
        })
    }
}

/// Snapshot of one record, for status checks and statistics.
#[derive(Debug, Clone, Copy)]
pub struct RecordView {
    /// Packet identifier.
    pub id: PacketId,
    /// Current state.
    pub status: PacketStatus,
    /// Serialized size in bytes.
    pub size: u64,
    /// When the datagram was handed to the sink.
    pub time_sent: Instant,
    /// Whether the packet carries a CRYPTO frame.
    pub is_crypto: bool,
}

/// Outcome of marking a record acknowledged.
#[derive(Debug, Clone, Copy)]
pub struct AckedInfo {
    /// False when the record had already reached a terminal state.
    pub newly_acked: bool,
    /// Serialized size in bytes.
    pub size: u64,
    /// When the datagram was handed to the sink.
    pub time_sent: Instant,
}

/// A packet claimed for retransmission.
#[derive(Debug)]
pub struct RetransmitClaim {
    /// Deep copy to re-enqueue; numbered afresh on emission.
    pub packet: QuicPacket,
    /// Serialized size of the original emission.
    pub size: u64,
    /// When the original was handed to the sink.
    pub time_sent: Instant,
}

struct InFlightRecord {
    time_sent: Instant,
    packet: QuicPacket,
    size: u64,
    acked: bool,
    resent: bool,
    lost_handlers: Vec<Option<Arc<dyn LostFrameHandler>>>,
}

impl InFlightRecord {
    fn status(&self) -> PacketStatus {
        if self.acked {
            PacketStatus::Acked
        } else if self.resent {
            PacketStatus::Resent
        } else {
            PacketStatus::InFlight
        }
    }
}

/// Registry of sent packets, shared between the send loop, the ACK
/// processor and the retransmission paths.
#[derive(Default)]
pub struct InFlightRegistry {
    records: Mutex<HashMap<PacketId, InFlightRecord>>,
}

impl InFlightRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the record for a packet that was just emitted.
    ///
    /// `lost_handlers` runs parallel to the packet's frames; an entry is
    /// invoked when its frame is declared lost.
    ///
    /// # Panics
    ///
    /// If the packet has no packet number yet; numbering happens before
    /// recording.
    pub fn record(
        &self,
        packet: QuicPacket,
        time_sent: Instant,
        size: u64,
        lost_handlers: Vec<Option<Arc<dyn LostFrameHandler>>>,
    ) -> Result<(), RegistryError> {
        let id = packet.id().expect("recorded packet must be numbered");
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&id) {
            return Err(RegistryError::DuplicatePacketId(id));
        }
        records.insert(
            id,
            InFlightRecord {
                time_sent,
                packet,
                size,
                acked: false,
                resent: false,
                lost_handlers,
            },
        );
        Ok(())
    }

    /// Mark a record acknowledged.
    ///
    /// Returns `None` when no record exists (spurious or forgotten
    /// acknowledgement). Acknowledging an already-terminal record reports
    /// `newly_acked: false` and changes nothing, which keeps ACK
    /// processing idempotent.
    pub fn mark_acked(&self, id: PacketId) -> Option<AckedInfo> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&id)?;
        let newly_acked = !record.acked && !record.resent;
        if newly_acked {
            record.acked = true;
        }
        Some(AckedInfo {
            newly_acked,
            size: record.size,
            time_sent: record.time_sent,
        })
    }

    /// Mark a record resent.
    ///
    /// Fails with [`RegistryError::InvalidTransition`] when the record is
    /// absent or already terminal; a packet is never both acked and
    /// resent.
    pub fn mark_resent(&self, id: PacketId) -> Result<(), RegistryError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&id)
            .ok_or(RegistryError::InvalidTransition(id))?;
        if record.acked || record.resent {
            return Err(RegistryError::InvalidTransition(id));
        }
        record.resent = true;
        Ok(())
    }

    /// Atomically claim a crypto packet for retransmission.
    ///
    /// Returns a deep copy of the packet when the record exists, carries a
    /// CRYPTO frame, and is neither acked nor resent; the record is marked
    /// resent in the same step. Any other state yields `None`, which is
    /// how stale timers cancel themselves.
    pub fn take_for_retransmit(&self, id: PacketId) -> Option<RetransmitClaim> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&id)?;
        if record.acked || record.resent || !record.packet.is_crypto() {
            return None;
        }
        record.resent = true;
        Some(RetransmitClaim {
            packet: record.packet.deep_copy(),
            size: record.size,
            time_sent: record.time_sent,
        })
    }

    /// Declare a packet lost: mark it resent and hand back its frames with
    /// their lost-frame handlers, so the caller can drive re-enqueueing.
    pub fn take_lost(
        &self,
        id: PacketId,
    ) -> Option<(u64, Instant, Vec<(Frame, Option<Arc<dyn LostFrameHandler>>)>)> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&id)?;
        if record.acked || record.resent {
            return None;
        }
        record.resent = true;
        let frames = record
            .packet
            .frames()
            .iter()
            .cloned()
            .zip(
                record
                    .lost_handlers
                    .iter()
                    .cloned()
                    .chain(std::iter::repeat(None)),
            )
            .collect();
        Some((record.size, record.time_sent, frames))
    }

    /// Snapshot of one record.
    pub fn view(&self, id: PacketId) -> Option<RecordView> {
        let records = self.records.lock().unwrap();
        records.get(&id).map(|record| RecordView {
            id,
            status: record.status(),
            size: record.size,
            time_sent: record.time_sent,
            is_crypto: record.packet.is_crypto(),
        })
    }

    /// Is any CRYPTO-bearing packet still unacknowledged and unresent?
    pub fn pending_crypto(&self) -> bool {
        let records = self.records.lock().unwrap();
        records
            .values()
            .any(|r| r.packet.is_crypto() && !r.acked && !r.resent)
    }

    /// Number of records not yet acknowledged.
    pub fn unacked_count(&self) -> usize {
        let records = self.records.lock().unwrap();
        records.values().filter(|r| !r.acked).count()
    }

    /// All records ordered by packet identifier, for statistics reporting.
    pub fn snapshot_sorted(&self) -> Vec<RecordView> {
        let records = self.records.lock().unwrap();
        let mut views: Vec<RecordView> = records
            .iter()
            .map(|(id, record)| RecordView {
                id: *id,
                status: record.status(),
                size: record.size,
                time_sent: record.time_sent,
                is_crypto: record.packet.is_crypto(),
            })
            .collect();
        views.sort_by_key(|v| v.id);
        views
    }
}

impl std::fmt::Debug for InFlightRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let records = self.records.lock().unwrap();
        f.debug_struct("InFlightRegistry")
            .field("records", &records.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CryptoFrame;
    use crate::packet::EncryptionLevel;

    fn numbered_packet(level: EncryptionLevel, pn: u64, frames: Vec<Frame>) -> QuicPacket {
        let mut packet = QuicPacket::with_frames(level, frames);
        packet.set_packet_number(pn);
        packet
    }

    fn crypto_packet(pn: u64) -> QuicPacket {
        numbered_packet(
            EncryptionLevel::Handshake,
            pn,
            vec![Frame::Crypto(CryptoFrame {
                offset: 0,
                data: vec![0; 16],
            })],
        )
    }

    #[test]
    fn test_duplicate_record_rejected() {
        let registry = InFlightRegistry::new();
        let now = Instant::now();
        registry
            .record(crypto_packet(0), now, 100, Vec::new())
            .unwrap();
        let err = registry
            .record(crypto_packet(0), now, 100, Vec::new())
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicatePacketId(_)));
    }

    #[test]
    fn test_mark_acked_unknown_is_none() {
        let registry = InFlightRegistry::new();
        let id = PacketId::new(EncryptionLevel::Application, 42);
        assert!(registry.mark_acked(id).is_none());
    }

    #[test]
    fn test_mark_acked_is_idempotent() {
        let registry = InFlightRegistry::new();
        let now = Instant::now();
        registry
            .record(crypto_packet(0), now, 100, Vec::new())
            .unwrap();

        let id = PacketId::new(EncryptionLevel::Handshake, 0);
        let first = registry.mark_acked(id).unwrap();
        assert!(first.newly_acked);
        let second = registry.mark_acked(id).unwrap();
        assert!(!second.newly_acked);
        assert_eq!(registry.view(id).unwrap().status, PacketStatus::Acked);
    }

    #[test]
    fn test_never_both_acked_and_resent() {
        let registry = InFlightRegistry::new();
        let now = Instant::now();
        registry
            .record(crypto_packet(0), now, 100, Vec::new())
            .unwrap();
        let id = PacketId::new(EncryptionLevel::Handshake, 0);

        registry.mark_resent(id).unwrap();
        // A late acknowledgement does not flip a resent record.
        let info = registry.mark_acked(id).unwrap();
        assert!(!info.newly_acked);
        assert_eq!(registry.view(id).unwrap().status, PacketStatus::Resent);

        // And resending twice is a caller bug.
        assert!(matches!(
            registry.mark_resent(id),
            Err(RegistryError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_pending_crypto_transitions() {
        let registry = InFlightRegistry::new();
        let now = Instant::now();
        assert!(!registry.pending_crypto());

        registry
            .record(crypto_packet(0), now, 100, Vec::new())
            .unwrap();
        assert!(registry.pending_crypto());

        registry
            .mark_acked(PacketId::new(EncryptionLevel::Handshake, 0))
            .unwrap();
        assert!(!registry.pending_crypto());
    }

    #[test]
    fn test_take_for_retransmit_claims_once() {
        let registry = InFlightRegistry::new();
        let now = Instant::now();
        registry
            .record(crypto_packet(5), now, 100, Vec::new())
            .unwrap();
        let id = PacketId::new(EncryptionLevel::Handshake, 5);

        let claim = registry.take_for_retransmit(id).unwrap();
        assert_eq!(claim.packet.packet_number(), None);
        assert_eq!(claim.packet.frames().len(), 1);
        assert_eq!(claim.size, 100);

        // Second fire of the same timer: record already resent.
        assert!(registry.take_for_retransmit(id).is_none());
    }

    #[test]
    fn test_take_for_retransmit_ignores_non_crypto() {
        let registry = InFlightRegistry::new();
        let now = Instant::now();
        let packet = numbered_packet(EncryptionLevel::Application, 0, vec![Frame::Ping]);
        registry.record(packet, now, 50, Vec::new()).unwrap();

        let id = PacketId::new(EncryptionLevel::Application, 0);
        assert!(registry.take_for_retransmit(id).is_none());
        assert_eq!(registry.view(id).unwrap().status, PacketStatus::InFlight);
    }

    #[test]
    fn test_snapshot_sorted_by_id() {
        let registry = InFlightRegistry::new();
        let now = Instant::now();
        registry
            .record(
                numbered_packet(EncryptionLevel::Application, 1, vec![Frame::Ping]),
                now,
                10,
                Vec::new(),
            )
            .unwrap();
        registry
            .record(crypto_packet(0), now, 20, Vec::new())
            .unwrap();
        registry
            .record(
                numbered_packet(EncryptionLevel::Application, 0, vec![Frame::Ping]),
                now,
                10,
                Vec::new(),
            )
            .unwrap();

        let ids: Vec<PacketId> = registry.snapshot_sorted().iter().map(|v| v.id).collect();
        assert_eq!(
            ids,
            vec![
                PacketId::new(EncryptionLevel::Handshake, 0),
                PacketId::new(EncryptionLevel::Application, 0),
                PacketId::new(EncryptionLevel::Application, 1),
            ]
        );
    }
}
