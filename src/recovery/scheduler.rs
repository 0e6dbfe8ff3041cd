//! Retransmission timer scheduling.
//!
//! A dedicated task polls a min-heap of `(deadline, packet id)` entries
//! and invokes a fire callback when the front deadline passes. Entries are
//! never removed early: cancellation happens by the callback finding the
//! target record already acked or resent.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::pending;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::packet::PacketId;

/// Handle to the timer task.
///
/// Dropping the handle (or closing the shutdown channel) stops the task;
/// entries still queued are discarded.
#[derive(Debug)]
pub struct RetransmitScheduler {
    tx: mpsc::UnboundedSender<(Instant, PacketId)>,
    task: JoinHandle<()>,
}

impl RetransmitScheduler {
    /// Spawn the timer task. `on_fire` runs on the task for every entry
    /// whose deadline passes; it must be cheap and non-blocking.
    pub fn spawn(
        mut shutdown: watch::Receiver<bool>,
        on_fire: impl Fn(PacketId) + Send + 'static,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Instant, PacketId)>();
        let task = tokio::spawn(async move {
            // The sequence number breaks ties so identical deadlines fire
            // in schedule order.
            let mut heap: BinaryHeap<Reverse<(Instant, u64, PacketId)>> = BinaryHeap::new();
            let mut seq = 0u64;
            loop {
                let next_deadline = heap.peek().map(|Reverse((deadline, _, _))| *deadline);
                tokio::select! {
                    entry = rx.recv() => {
                        match entry {
                            Some((deadline, id)) => {
                                heap.push(Reverse((deadline, seq, id)));
                                seq += 1;
                            }
                            None => break,
                        }
                    }
                    _ = wait(next_deadline) => {
                        if let Some(Reverse((_, _, id))) = heap.pop() {
                            on_fire(id);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("retransmit scheduler stopping");
                            break;
                        }
                    }
                }
            }
        });
        Self { tx, task }
    }

    /// Arm a timer for `id`, `delay` from now.
    pub fn schedule(&self, delay: Duration, id: PacketId) {
        // A closed channel means the task is shutting down; late timers
        // are irrelevant then.
        let _ = self.tx.send((Instant::now() + delay, id));
    }

    /// Abort the task outright.
    pub fn stop(&self) {
        self.task.abort();
    }
}

async fn wait(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::packet::EncryptionLevel;

    fn id(pn: u64) -> PacketId {
        PacketId::new(EncryptionLevel::Handshake, pn)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_deadline() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = {
            let fired = Arc::clone(&fired);
            RetransmitScheduler::spawn(shutdown_rx, move |id| {
                fired.lock().unwrap().push(id);
            })
        };

        scheduler.schedule(Duration::from_millis(200), id(0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*fired.lock().unwrap(), vec![id(0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_in_deadline_order() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = {
            let fired = Arc::clone(&fired);
            RetransmitScheduler::spawn(shutdown_rx, move |id| {
                fired.lock().unwrap().push(id);
            })
        };

        scheduler.schedule(Duration::from_millis(300), id(1));
        scheduler.schedule(Duration::from_millis(100), id(2));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(*fired.lock().unwrap(), vec![id(2), id(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_pending() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = {
            let fired = Arc::clone(&fired);
            RetransmitScheduler::spawn(shutdown_rx, move |id| {
                fired.lock().unwrap().push(id);
            })
        };

        scheduler.schedule(Duration::from_millis(100), id(0));
        shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired.lock().unwrap().is_empty());
    }
}
