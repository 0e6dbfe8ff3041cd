//! Per-level packet number allocation.

use std::sync::atomic::{AtomicU64, Ordering};

use super::EncryptionLevel;

/// Monotonic packet-number counters, one per encryption level.
///
/// Numbers within a level form a gap-free increasing sequence starting at
/// zero. There is no ordering between levels.
#[derive(Debug, Default)]
pub struct PacketNumberAllocator {
    counters: [AtomicU64; 3],
}

impl PacketNumberAllocator {
    /// All counters start at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next packet number for `level`.
    pub fn next(&self, level: EncryptionLevel) -> u64 {
        self.counters[level.index()].fetch_add(1, Ordering::Relaxed)
    }

    /// The number the next call to [`next`](Self::next) would return.
    pub fn peek(&self, level: EncryptionLevel) -> u64 {
        self.counters[level.index()].load(Ordering::Relaxed)
    }
}
