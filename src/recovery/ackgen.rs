//! Acknowledgement generation for received packets.
//!
//! One tracker per packet-number space records which packet numbers have
//! arrived and builds ACK frames with gap/range encoding on demand. Once
//! an ACK we sent is itself acknowledged, the covered numbers are
//! forgotten.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Instant;

use crate::core::constants::ACK_DELAY_EXPONENT;
use crate::frame::{AckFrame, AckRange};
use crate::packet::EncryptionLevel;

#[derive(Debug, Default)]
struct AckSpace {
    received: BTreeSet<u64>,
    largest_received_at: Option<Instant>,
    unacked_arrivals: bool,
}

/// Per-level tracker of received packet numbers.
#[derive(Debug, Default)]
pub struct AckGenerator {
    spaces: [Mutex<AckSpace>; 3],
}

impl AckGenerator {
    /// Nothing received yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an ack-eliciting packet received at `level`.
    pub fn packet_received(&self, level: EncryptionLevel, packet_number: u64, now: Instant) {
        let mut space = self.spaces[level.index()].lock().unwrap();
        let largest_so_far = space.received.iter().next_back().copied();
        if space.received.insert(packet_number) {
            space.unacked_arrivals = true;
            if largest_so_far.is_none_or(|largest| packet_number > largest) {
                space.largest_received_at = Some(now);
            }
        }
    }

    /// Build an ACK frame covering everything received at `level`.
    ///
    /// Returns `None` when nothing new arrived since the last generated
    /// frame, so callers do not emit redundant acknowledgements.
    pub fn generate(&self, level: EncryptionLevel, now: Instant) -> Option<AckFrame> {
        let mut space = self.spaces[level.index()].lock().unwrap();
        if !space.unacked_arrivals || space.received.is_empty() {
            return None;
        }
        space.unacked_arrivals = false;

        let delay = space
            .largest_received_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();

        let mut descending = space.received.iter().rev().copied();
        let largest = descending.next().expect("non-empty");

        // Walk descending packet numbers, folding contiguous runs into
        // ranges separated by gaps.
        let mut ranges = Vec::new();
        let mut run_start = largest; // largest pn of the current run
        let mut run_end = largest; // smallest pn of the current run
        for pn in descending {
            if pn + 1 == run_end {
                run_end = pn;
            } else {
                ranges.push((run_start, run_end));
                run_start = pn;
                run_end = pn;
            }
        }
        ranges.push((run_start, run_end));

        let (first_largest, first_smallest) = ranges[0];
        let mut frame = AckFrame {
            largest_acknowledged: first_largest,
            ack_delay_raw: (delay.as_micros() as u64) >> ACK_DELAY_EXPONENT,
            first_range: first_largest - first_smallest,
            ranges: Vec::with_capacity(ranges.len() - 1),
        };
        let mut prev_smallest = first_smallest;
        for (range_largest, range_smallest) in ranges.into_iter().skip(1) {
            frame.ranges.push(AckRange {
                gap: prev_smallest - range_largest - 2,
                length: range_largest - range_smallest,
            });
            prev_smallest = range_smallest;
        }
        Some(frame)
    }

    /// An ACK we sent covering numbers up to `largest` was acknowledged by
    /// the peer; the covered numbers no longer need re-acknowledging.
    pub fn confirm_acknowledged(&self, level: EncryptionLevel, largest: u64) {
        let mut space = self.spaces[level.index()].lock().unwrap();
        space.received.retain(|&pn| pn > largest);
    }
}
