//! Loss recovery: RTT estimation, in-flight tracking, ACK processing and
//! retransmission scheduling.

pub mod ack;
pub mod ackgen;
pub mod inflight;
pub mod rtt;
pub mod scheduler;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::frame::Frame;

pub use ack::AckProcessor;
pub use ackgen::AckGenerator;
pub use inflight::{AckedInfo, InFlightRegistry, PacketStatus, RecordView, RetransmitClaim};
pub use rtt::RttEstimator;
pub use scheduler::RetransmitScheduler;

/// What to do when a frame is declared lost.
///
/// A handler is attached to an outbound request, stored alongside the
/// frame in the in-flight record, and invoked by the loss path; it never
/// outlives the record that holds it.
pub trait LostFrameHandler: Send + Sync {
    /// React to the loss of `frame` — typically by re-enqueueing a
    /// replacement.
    fn on_frame_lost(self: Arc<Self>, frame: Frame);
}

/// Tracks whether any CRYPTO-bearing packet is in flight, plus the shared
/// exponential-backoff counter for failed crypto retransmissions.
#[derive(Debug, Default)]
pub struct HandshakeFlight {
    crypto_in_flight: AtomicBool,
    failed_retries: AtomicU32,
}

impl HandshakeFlight {
    /// Nothing in flight, no failed retries.
    pub fn new() -> Self {
        Self::default()
    }

    /// A CRYPTO-bearing packet was just emitted.
    pub fn on_crypto_sent(&self) {
        self.crypto_in_flight.store(true, Ordering::Release);
    }

    /// Is a CRYPTO-bearing packet currently in flight?
    pub fn crypto_in_flight(&self) -> bool {
        self.crypto_in_flight.load(Ordering::Acquire)
    }

    /// Update the flag from recomputed registry state. On the true→false
    /// transition the failed-retries counter resets to zero.
    pub fn set_crypto_in_flight(&self, pending: bool) {
        let was = self.crypto_in_flight.swap(pending, Ordering::AcqRel);
        if was && !pending {
            self.failed_retries.store(0, Ordering::Release);
        }
    }

    /// Current failed-retry count.
    pub fn failed_retries(&self) -> u32 {
        self.failed_retries.load(Ordering::Acquire)
    }

    /// Count one more failed crypto retransmission; returns the new count.
    pub fn bump_failed_retries(&self) -> u32 {
        self.failed_retries.fetch_add(1, Ordering::AcqRel) + 1
    }
}
