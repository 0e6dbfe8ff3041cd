//! Acknowledgement processing.
//!
//! Consumes ACK frames received from the peer: feeds the RTT estimator,
//! drives registry transitions, releases congestion-controller accounting,
//! and resolves the handshake-in-flight flag.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::debug;

use crate::congestion::CongestionController;
use crate::frame::AckFrame;
use crate::packet::{EncryptionLevel, PacketId};

use super::inflight::InFlightRegistry;
use super::rtt::RttEstimator;
use super::HandshakeFlight;

/// Applies received ACK frames to the recovery state.
///
/// Spurious content — unknown packet numbers, ACKs at levels whose keys
/// (and records) are gone — is absorbed silently; processing the same ACK
/// twice leaves the registry in the same state as processing it once.
pub struct AckProcessor {
    registry: Arc<InFlightRegistry>,
    rtt: Arc<Mutex<RttEstimator>>,
    congestion: Arc<CongestionController>,
    handshake: Arc<HandshakeFlight>,
}

impl AckProcessor {
    /// Wire the processor to the shared recovery state.
    pub fn new(
        registry: Arc<InFlightRegistry>,
        rtt: Arc<Mutex<RttEstimator>>,
        congestion: Arc<CongestionController>,
        handshake: Arc<HandshakeFlight>,
    ) -> Self {
        Self {
            registry,
            rtt,
            congestion,
            handshake,
        }
    }

    /// Process one ACK frame received at `level`.
    pub fn process(&self, ack: &AckFrame, level: EncryptionLevel, time_received: Instant) {
        self.feed_rtt_sample(ack, level, time_received);

        for pn in ack.acked_packet_numbers() {
            let id = PacketId::new(level, pn);
            let Some(info) = self.registry.mark_acked(id) else {
                // Spurious or already-forgotten packet number.
                continue;
            };
            if info.newly_acked {
                debug!(
                    packet = %id,
                    after_ms = time_received.saturating_duration_since(info.time_sent).as_millis() as u64,
                    "packet acknowledged"
                );
                self.congestion.register_acked(info.size, info.time_sent);
            }
        }

        let pending = self.registry.pending_crypto();
        self.handshake.set_crypto_in_flight(pending);
        if !pending {
            debug!("no crypto in flight");
        }
    }

    /// An RTT sample is taken only from the largest acknowledged packet
    /// number, when its record is known.
    fn feed_rtt_sample(&self, ack: &AckFrame, level: EncryptionLevel, time_received: Instant) {
        let id = PacketId::new(level, ack.largest_acknowledged);
        if let Some(view) = self.registry.view(id) {
            self.rtt
                .lock()
                .unwrap()
                .add_sample(time_received, view.time_sent, ack.ack_delay());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::congestion::NewRenoController;
    use crate::frame::{CryptoFrame, Frame};
    use crate::packet::QuicPacket;
    use crate::recovery::inflight::PacketStatus;

    struct Fixture {
        processor: AckProcessor,
        registry: Arc<InFlightRegistry>,
        rtt: Arc<Mutex<RttEstimator>>,
        congestion: Arc<CongestionController>,
        handshake: Arc<HandshakeFlight>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(InFlightRegistry::new());
        let rtt = Arc::new(Mutex::new(RttEstimator::new()));
        let congestion = Arc::new(CongestionController::new(Box::new(
            NewRenoController::with_window(1200, 10_000),
        )));
        let handshake = Arc::new(HandshakeFlight::new());
        Fixture {
            processor: AckProcessor::new(
                Arc::clone(&registry),
                Arc::clone(&rtt),
                Arc::clone(&congestion),
                Arc::clone(&handshake),
            ),
            registry,
            rtt,
            congestion,
            handshake,
        }
    }

    fn record(fx: &Fixture, level: EncryptionLevel, pn: u64, size: u64, crypto: bool, at: Instant) {
        let frames = if crypto {
            vec![Frame::Crypto(CryptoFrame {
                offset: 0,
                data: vec![0; 8],
            })]
        } else {
            vec![Frame::Ping]
        };
        let mut packet = QuicPacket::with_frames(level, frames);
        packet.set_packet_number(pn);
        fx.registry.record(packet, at, size, Vec::new()).unwrap();
        fx.congestion.register_in_flight(size);
    }

    #[test]
    fn test_ack_releases_congestion_accounting() {
        let fx = fixture();
        let sent = Instant::now();
        record(&fx, EncryptionLevel::Application, 0, 1200, false, sent);
        assert_eq!(fx.congestion.bytes_in_flight(), 1200);

        fx.processor.process(
            &AckFrame::for_packet(0),
            EncryptionLevel::Application,
            sent + Duration::from_millis(40),
        );
        assert_eq!(fx.congestion.bytes_in_flight(), 0);
        assert_eq!(
            fx.registry
                .view(PacketId::new(EncryptionLevel::Application, 0))
                .unwrap()
                .status,
            PacketStatus::Acked
        );
    }

    #[test]
    fn test_rtt_sample_from_largest_acknowledged() {
        let fx = fixture();
        let sent = Instant::now();
        record(&fx, EncryptionLevel::Application, 0, 100, false, sent);

        fx.processor.process(
            &AckFrame::for_packet(0),
            EncryptionLevel::Application,
            sent + Duration::from_millis(64),
        );
        let rtt = fx.rtt.lock().unwrap();
        assert!(rtt.has_sample());
        assert_eq!(rtt.smoothed_rtt_ms(), 64);
    }

    #[test]
    fn test_unknown_packet_number_is_noop() {
        let fx = fixture();
        fx.processor.process(
            &AckFrame::for_packet(9),
            EncryptionLevel::Application,
            Instant::now(),
        );
        assert!(!fx.rtt.lock().unwrap().has_sample());
        assert_eq!(fx.congestion.bytes_in_flight(), 0);
    }

    #[test]
    fn test_wrong_level_is_noop() {
        let fx = fixture();
        let sent = Instant::now();
        record(&fx, EncryptionLevel::Application, 0, 1200, false, sent);

        fx.processor
            .process(&AckFrame::for_packet(0), EncryptionLevel::Handshake, sent);
        assert_eq!(fx.congestion.bytes_in_flight(), 1200);
    }

    #[test]
    fn test_duplicate_ack_is_idempotent() {
        let fx = fixture();
        let sent = Instant::now();
        record(&fx, EncryptionLevel::Application, 0, 1200, false, sent);

        let ack = AckFrame::for_packet(0);
        fx.processor
            .process(&ack, EncryptionLevel::Application, sent);
        let window_after_first = fx.congestion.window();
        fx.processor
            .process(&ack, EncryptionLevel::Application, sent);

        // Second application: no further congestion credit, same registry state.
        assert_eq!(fx.congestion.window(), window_after_first);
        assert_eq!(fx.congestion.bytes_in_flight(), 0);
    }

    #[test]
    fn test_crypto_ack_clears_handshake_flight_and_retries() {
        let fx = fixture();
        let sent = Instant::now();
        record(&fx, EncryptionLevel::Handshake, 0, 500, true, sent);
        fx.handshake.on_crypto_sent();
        fx.handshake.bump_failed_retries();

        fx.processor
            .process(&AckFrame::for_packet(0), EncryptionLevel::Handshake, sent);

        assert!(!fx.handshake.crypto_in_flight());
        assert_eq!(fx.handshake.failed_retries(), 0);
    }

    #[test]
    fn test_partial_crypto_ack_keeps_flight() {
        let fx = fixture();
        let sent = Instant::now();
        record(&fx, EncryptionLevel::Handshake, 0, 500, true, sent);
        record(&fx, EncryptionLevel::Handshake, 1, 500, true, sent);
        fx.handshake.on_crypto_sent();

        fx.processor
            .process(&AckFrame::for_packet(0), EncryptionLevel::Handshake, sent);
        assert!(fx.handshake.crypto_in_flight());
    }
}
