use std::sync::atomic::{AtomicU64, Ordering};

/// Per-class counters shared between producers (enqueue accounting), the
/// consumer (rate estimate) and the read-only stats surface.
#[derive(Debug, Default)]
pub(crate) struct ClassCounters {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    pub drops: AtomicU64,
    pub rate_bps: AtomicU64,
}

impl ClassCounters {
    pub fn on_enqueue(&self, len: u32) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn on_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

/// Read-only snapshot of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    pub packets: u64,
    pub bytes: u64,
    pub drops: u64,
    /// Smoothed dequeue rate, bits per second.
    pub rate_bps: u64,
    /// Packets currently waiting in the sub-queue.
    pub qlen: u32,
    pub weight: u32,
    pub lmax: u32,
}

/// Read-only snapshot of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedStats {
    /// Sum of configured class weights.
    pub wsum: u64,
    /// Sum of weights of currently backlogged classes.
    pub wsum_active: u64,
    /// Number of classes currently slotted for service.
    pub active_classes: u32,
    /// Packets dropped before reaching any sub-queue plus sub-queue
    /// rejections.
    pub drops: u64,
}

/// Exponentially weighted moving average with a 7/8 decay, matching the
/// smoothing the rate estimator has always used.
pub(crate) fn ewma(old: u64, sample: u64) -> u64 {
    (old * 7 + sample) >> 3
}
