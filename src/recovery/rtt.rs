//! Round-trip-time estimation from acknowledgement samples.

use std::time::{Duration, Instant};

use crate::core::constants::INITIAL_SMOOTHED_RTT_MS;

/// Exponentially weighted RTT state.
///
/// All values are kept in microseconds; [`smoothed_rtt_ms`] rounds down to
/// milliseconds, which is all the retransmission timers need.
///
/// [`smoothed_rtt_ms`]: RttEstimator::smoothed_rtt_ms
#[derive(Debug, Clone)]
pub struct RttEstimator {
    smoothed_us: u64,
    variance_us: u64,
    min_us: u64,
    latest_us: u64,
    has_sample: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Before any sample the smoothed RTT is assumed to be 100 ms.
    pub fn new() -> Self {
        Self {
            smoothed_us: INITIAL_SMOOTHED_RTT_MS * 1000,
            variance_us: 0,
            min_us: u64::MAX,
            latest_us: 0,
            has_sample: false,
        }
    }

    /// Feed one acknowledgement sample.
    ///
    /// `peer_ack_delay` is subtracted from the measured latency when it
    /// fits; an impossibly large delay leaves the raw measurement in
    /// place rather than discarding the sample.
    pub fn add_sample(&mut self, now: Instant, time_sent: Instant, peer_ack_delay: Duration) {
        let mut latest = now.saturating_duration_since(time_sent).as_micros() as u64;
        let ack_delay = peer_ack_delay.as_micros() as u64;
        if ack_delay <= latest {
            latest -= ack_delay;
        }

        self.latest_us = latest;
        self.min_us = self.min_us.min(latest);

        if !self.has_sample {
            self.smoothed_us = latest;
            self.variance_us = latest / 2;
            self.has_sample = true;
        } else {
            self.variance_us =
                (3 * self.variance_us + self.smoothed_us.abs_diff(latest)) / 4;
            self.smoothed_us = (7 * self.smoothed_us + latest) / 8;
        }
    }

    /// Smoothed RTT in whole milliseconds.
    pub fn smoothed_rtt_ms(&self) -> u64 {
        self.smoothed_us / 1000
    }

    /// Smoothed RTT as a duration.
    pub fn smoothed_rtt(&self) -> Duration {
        Duration::from_micros(self.smoothed_us)
    }

    /// RTT variance as a duration.
    pub fn variance(&self) -> Duration {
        Duration::from_micros(self.variance_us)
    }

    /// Smallest sample observed, if any.
    pub fn min_rtt(&self) -> Option<Duration> {
        self.has_sample.then(|| Duration::from_micros(self.min_us))
    }

    /// Most recent sample, if any.
    pub fn latest(&self) -> Option<Duration> {
        self.has_sample.then(|| Duration::from_micros(self.latest_us))
    }

    /// Has at least one sample been applied?
    pub fn has_sample(&self) -> bool {
        self.has_sample
    }
}
