use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::class::ClassId;

/// "Class went from empty to backlogged" message. Carries the length of
/// the packet that caused the transition so the consumer can compute the
/// finish timestamp before it ever looks at the sub-queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ActivationEvent {
    pub class_id: ClassId,
    pub pkt_len: u32,
}

struct Shard {
    queue: Mutex<VecDeque<ActivationEvent>>,
}

/// Per-producer activation queues plus the work bitmap the consumer polls.
///
/// Publication order matters: the event is appended under the shard lock
/// (the unlock is a release barrier) before the shard's bit is set, so a
/// consumer that observes the bit and drains the shard is guaranteed to
/// see the event.
pub(crate) struct ActivationQueues {
    shards: Vec<Shard>,
    work_bitmap: AtomicU64,
}

impl ActivationQueues {
    pub fn new(shards: usize) -> Self {
        assert!(
            shards >= 1 && shards <= 64,
            "shard count {shards} outside 1..=64"
        );
        ActivationQueues {
            shards: (0..shards)
                .map(|_| Shard {
                    queue: Mutex::new(VecDeque::new()),
                })
                .collect(),
            work_bitmap: AtomicU64::new(0),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Producer side: append an event and mark the shard pending.
    pub fn publish(&self, shard: usize, event: ActivationEvent) {
        self.shards[shard].queue.lock().push_back(event);
        self.work_bitmap.fetch_or(1 << shard, Ordering::SeqCst);
    }

    /// Cheap hint for the consumer's wait loop; may be stale.
    pub fn work_pending(&self) -> bool {
        self.work_bitmap.load(Ordering::Relaxed) != 0
    }

    /// Consumer side: test-and-clear one shard's pending bit and, if it
    /// was set, take its queued events.
    pub fn drain_shard(&self, shard: usize, out: &mut Vec<ActivationEvent>) -> bool {
        let bit = 1u64 << shard;
        if self.work_bitmap.fetch_and(!bit, Ordering::SeqCst) & bit == 0 {
            return false;
        }
        let mut queue = self.shards[shard].queue.lock();
        out.extend(queue.drain(..));
        true
    }

    /// Drop everything queued everywhere.
    pub fn clear(&self) {
        self.work_bitmap.store(0, Ordering::SeqCst);
        for shard in &self.shards {
            shard.queue.lock().clear();
        }
    }
}
