use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fifo::SubQueue;
use crate::stats::ClassCounters;

use super::timestamps::fls64;
use super::{ONE_FP, QFQ_MAX_INDEX, QFQ_MIN_SLOT_SHIFT};

pub type ClassId = u32;

/// The producer-facing half of a class: the sub-queue plus the few fields
/// the enqueue path needs without touching scheduler state. Shared by Arc
/// between the registry, the per-producer classifier caches and the
/// consumer-owned [`ClassState`].
pub(crate) struct ClassChannel {
    pub(crate) queue: Mutex<Box<dyn SubQueue>>,
    /// Snapshot of the reciprocal weight. Producers read it to skip
    /// activation events for weight-zero classes; deletion stores the
    /// sentinel here so stale cached handles go quiet.
    pub(crate) inv_w: AtomicU64,
    pub(crate) counters: ClassCounters,
}

impl ClassChannel {
    pub fn new(queue: Box<dyn SubQueue>, inv_w: u64) -> Self {
        ClassChannel {
            queue: Mutex::new(queue),
            inv_w: AtomicU64::new(inv_w),
            counters: ClassCounters::default(),
        }
    }

    pub fn qlen(&self) -> u32 {
        self.queue.lock().len()
    }

    pub fn peek_len(&self) -> u32 {
        self.queue.lock().peek_len()
    }

    pub fn is_zero_weight(&self) -> bool {
        self.inv_w.load(Ordering::Acquire) == ONE_FP + 1
    }
}

/// The consumer-owned half of a class: exact virtual timestamps and the
/// group membership derived from (inv_w, lmax). Only the thread driving
/// dequeue (or a control operation holding the core lock) touches this.
pub(crate) struct ClassState {
    /// Virtual start/finish timestamps.
    pub s: u64,
    pub f: u64,
    /// ONE_FP / weight; ONE_FP + 1 is the weight-zero sentinel.
    pub inv_w: u64,
    /// Configured maximum packet size.
    pub lmax: u32,
    pub grp_idx: u32,
    /// True while the class occupies a slot in its group.
    pub active: bool,
    /// Rate estimator state, mirrored into the shared counters.
    pub rate_bps: u64,
    pub last_deq_ns: u64,
    pub channel: Arc<ClassChannel>,
}

impl ClassState {
    pub fn new(inv_w: u64, lmax: u32, channel: Arc<ClassChannel>) -> Self {
        ClassState {
            s: 0,
            f: 0,
            inv_w,
            lmax,
            grp_idx: calc_index(inv_w, lmax),
            active: false,
            rate_bps: 0,
            last_deq_ns: 0,
            channel,
        }
    }

    /// Configured weight. 0 for the weight-zero sentinel.
    pub fn weight(&self) -> u64 {
        ONE_FP / self.inv_w
    }
}

/// Group index for a class: log2(lmax / weight) scaled to the slot layout.
/// Classes whose per-packet virtual-time cost falls in the same octave end
/// up in the same group.
pub(crate) fn calc_index(inv_w: u64, lmax: u32) -> u32 {
    if inv_w == ONE_FP + 1 {
        return 0;
    }

    let slot_size = lmax as u64 * inv_w;
    let size_map = slot_size >> QFQ_MIN_SLOT_SHIFT;
    if size_map == 0 {
        return 0;
    }

    let mut index = fls64(size_map);
    // an exact power-of-two slot size still fits the next group down
    if slot_size == 1u64 << (index + QFQ_MIN_SLOT_SHIFT - 1) {
        index -= 1;
    }

    debug_assert!(index <= QFQ_MAX_INDEX);
    index
}
