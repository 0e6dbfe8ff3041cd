//! Congestion control.
//!
//! The send loop depends only on the [`CongestionController`] handle:
//! admission (`can_send`), in-flight registration, ack/loss callbacks, and
//! a bounded wait for admission changes. The window arithmetic behind it
//! is pluggable via [`CongestionAlgorithm`]; a window-halving default is
//! provided.
//!
//! One pool of in-flight bytes covers all packet-number spaces.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Window arithmetic consumed by the controller.
///
/// Implementations are single-threaded; the controller serializes access.
pub trait CongestionAlgorithm: Send {
    /// Current congestion window in bytes.
    fn window(&self) -> u64;

    /// Bytes sent but neither acknowledged nor declared lost.
    fn bytes_in_flight(&self) -> u64;

    /// Bytes handed to the network.
    fn on_packet_sent(&mut self, bytes: u64);

    /// Bytes acknowledged; may grow the window.
    fn on_packet_acked(&mut self, bytes: u64, time_sent: Instant, now: Instant);

    /// Bytes declared lost; may shrink the window.
    fn on_packet_lost(&mut self, bytes: u64, time_sent: Instant, now: Instant);
}

/// Default algorithm: slow start, congestion avoidance, and a halved
/// window on loss with a recovery period that absorbs further losses of
/// packets sent before the loss event.
#[derive(Debug)]
pub struct NewRenoController {
    cwnd: u64,
    ssthresh: u64,
    bytes_in_flight: u64,
    recovery_start: Option<Instant>,
    max_datagram_size: u64,
    minimum_window: u64,
}

impl NewRenoController {
    /// Standard initial window: `max(10 * max_datagram_size, 14720)`.
    pub fn new(max_datagram_size: u64) -> Self {
        Self {
            cwnd: (10 * max_datagram_size).max(14_720),
            ssthresh: u64::MAX,
            bytes_in_flight: 0,
            recovery_start: None,
            max_datagram_size,
            minimum_window: 2 * max_datagram_size,
        }
    }

    /// Start from a fixed window instead of the standard initial window.
    pub fn with_window(max_datagram_size: u64, window: u64) -> Self {
        Self {
            cwnd: window,
            ..Self::new(max_datagram_size)
        }
    }

    fn in_recovery(&self, time_sent: Instant) -> bool {
        self.recovery_start.is_some_and(|start| time_sent <= start)
    }
}

impl CongestionAlgorithm for NewRenoController {
    fn window(&self) -> u64 {
        self.cwnd
    }

    fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    fn on_packet_sent(&mut self, bytes: u64) {
        self.bytes_in_flight += bytes;
    }

    fn on_packet_acked(&mut self, bytes: u64, time_sent: Instant, _now: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);

        // Packets sent before the recovery point do not grow the window.
        if self.in_recovery(time_sent) {
            return;
        }

        if self.cwnd < self.ssthresh {
            // Slow start.
            self.cwnd += bytes;
        } else {
            // Congestion avoidance: about one datagram per window per RTT.
            self.cwnd += self.max_datagram_size * bytes / self.cwnd;
        }
    }

    fn on_packet_lost(&mut self, bytes: u64, time_sent: Instant, now: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);

        if self.in_recovery(time_sent) {
            return;
        }

        self.recovery_start = Some(now);
        self.ssthresh = (self.cwnd / 2).max(self.minimum_window);
        self.cwnd = self.ssthresh;
    }
}

/// Shared congestion controller handle.
///
/// Wraps an algorithm behind a mutex and signals admission changes through
/// a [`Notify`], so the send loop can block until an ack or loss plausibly
/// opened the window.
pub struct CongestionController {
    inner: Mutex<Box<dyn CongestionAlgorithm>>,
    changed: Notify,
}

impl CongestionController {
    /// Wrap `algorithm`.
    pub fn new(algorithm: Box<dyn CongestionAlgorithm>) -> Self {
        Self {
            inner: Mutex::new(algorithm),
            changed: Notify::new(),
        }
    }

    /// Would `bytes` more in flight still fit the window?
    pub fn can_send(&self, bytes: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.bytes_in_flight() + bytes <= inner.window()
    }

    /// Register bytes handed to the network.
    pub fn register_in_flight(&self, bytes: u64) {
        self.inner.lock().unwrap().on_packet_sent(bytes);
    }

    /// Register acknowledged bytes and wake admission waiters.
    pub fn register_acked(&self, bytes: u64, time_sent: Instant) {
        self.inner
            .lock()
            .unwrap()
            .on_packet_acked(bytes, time_sent, Instant::now());
        self.changed.notify_waiters();
    }

    /// Register lost bytes and wake admission waiters.
    pub fn register_lost(&self, bytes: u64, time_sent: Instant) {
        self.inner
            .lock()
            .unwrap()
            .on_packet_lost(bytes, time_sent, Instant::now());
        self.changed.notify_waiters();
    }

    /// Current congestion window.
    pub fn window(&self) -> u64 {
        self.inner.lock().unwrap().window()
    }

    /// Current bytes in flight.
    pub fn bytes_in_flight(&self) -> u64 {
        self.inner.lock().unwrap().bytes_in_flight()
    }

    /// Wait until an ack or loss was processed, or `max_wait` elapsed.
    ///
    /// The bound keeps the caller interruptible even against a controller
    /// that never releases admission.
    pub async fn wait_for_update(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.changed.notified()).await;
    }
}

impl std::fmt::Debug for CongestionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("CongestionController")
            .field("window", &inner.window())
            .field("bytes_in_flight", &inner.bytes_in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MDS: u64 = 1200;

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_initial_window() {
        let cc = NewRenoController::new(MDS);
        assert_eq!(cc.window(), 14_720);
        assert_eq!(cc.bytes_in_flight(), 0);

        let cc = NewRenoController::new(1500);
        assert_eq!(cc.window(), 15_000);
    }

    #[test]
    fn test_slow_start_grows_by_acked_bytes() {
        let base = Instant::now();
        let mut cc = NewRenoController::new(MDS);
        let initial = cc.window();

        cc.on_packet_sent(1200);
        cc.on_packet_acked(1200, at(base, 0), at(base, 50));

        assert_eq!(cc.window(), initial + 1200);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn test_loss_halves_window_and_enters_recovery() {
        let base = Instant::now();
        let mut cc = NewRenoController::new(MDS);
        let initial = cc.window();

        cc.on_packet_sent(1200);
        cc.on_packet_lost(1200, at(base, 0), at(base, 100));

        assert_eq!(cc.window(), (initial / 2).max(2 * MDS));

        // A second loss of a packet sent before the recovery point does
        // not halve again.
        let after_first = cc.window();
        cc.on_packet_sent(1200);
        cc.on_packet_lost(1200, at(base, 50), at(base, 200));
        assert_eq!(cc.window(), after_first);
    }

    #[test]
    fn test_ack_during_recovery_does_not_grow() {
        let base = Instant::now();
        let mut cc = NewRenoController::new(MDS);

        cc.on_packet_sent(1200);
        cc.on_packet_sent(1200);
        cc.on_packet_lost(1200, at(base, 0), at(base, 100));
        let during = cc.window();

        cc.on_packet_acked(1200, at(base, 50), at(base, 150));
        assert_eq!(cc.window(), during);
    }

    #[test]
    fn test_congestion_avoidance_increment() {
        let base = Instant::now();
        let mut cc = NewRenoController::new(MDS);
        cc.on_packet_sent(1200);
        cc.on_packet_lost(1200, at(base, 0), at(base, 10));
        let cwnd = cc.window();

        cc.on_packet_sent(1200);
        cc.on_packet_acked(1200, at(base, 20), at(base, 30));
        assert_eq!(cc.window(), cwnd + MDS * 1200 / cwnd);
    }

    #[test]
    fn test_controller_admission() {
        let cc = CongestionController::new(Box::new(NewRenoController::with_window(MDS, 1250)));
        assert!(cc.can_send(1250));
        assert!(!cc.can_send(1251));

        cc.register_in_flight(1240);
        assert!(cc.can_send(10));
        assert!(!cc.can_send(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_update_bounded() {
        let cc = CongestionController::new(Box::new(NewRenoController::with_window(MDS, 100)));
        cc.register_in_flight(100);

        // No ack ever arrives; the wait still returns after the bound.
        let started = tokio::time::Instant::now();
        cc.wait_for_update(Duration::from_millis(50)).await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_for_update_woken_by_ack() {
        use std::sync::Arc;

        let cc = Arc::new(CongestionController::new(Box::new(
            NewRenoController::with_window(MDS, 1250),
        )));
        cc.register_in_flight(1240);

        let waiter = {
            let cc = Arc::clone(&cc);
            tokio::spawn(async move {
                while !cc.can_send(1240) {
                    cc.wait_for_update(Duration::from_secs(5)).await;
                }
            })
        };

        tokio::task::yield_now().await;
        cc.register_acked(1240, Instant::now());
        waiter.await.unwrap();
        assert!(cc.can_send(1240));
    }
}
