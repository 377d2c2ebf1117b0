use std::sync::atomic::{AtomicU32, Ordering};

use smallvec::SmallVec;

use super::class::ClassId;
use super::{FRAC_BITS, QFQ_MAX_INDEX, QFQ_MAX_SLOTS, QFQ_MTU_SHIFT};

/// Occurrence counter for the slot-overflow diagnostic. Logs on the first
/// few occurrences and then once per power-of-two count.
static SLOT_CLAMPS: AtomicU32 = AtomicU32::new(0);

fn clamp_should_log() -> bool {
    let n = SLOT_CLAMPS.fetch_add(1, Ordering::Relaxed);
    n == 0 || n.is_power_of_two()
}

/// A group of classes sharing one log2(lmax / weight) octave.
///
/// Backlogged classes live in a ring of `QFQ_MAX_SLOTS` buckets indexed by
/// their rounded start time relative to the group start. `front` is the
/// physical index of logical slot 0 and `full_slots` tracks occupancy
/// relative to `front`, so advancing the group is a shift + rotate instead
/// of moving entries around.
pub(crate) struct Group {
    /// Group virtual start/finish timestamps (slot-aligned).
    pub s: u64,
    pub f: u64,
    pub slot_shift: u32,
    pub index: u32,
    pub front: usize,
    /// Bit k set iff logical slot k is non-empty.
    pub full_slots: u32,
    slots: [SmallVec<[ClassId; 2]>; QFQ_MAX_SLOTS],
}

impl Group {
    pub fn new(index: u32) -> Self {
        Group {
            s: 0,
            f: 0,
            slot_shift: QFQ_MTU_SHIFT + FRAC_BITS - (QFQ_MAX_INDEX - index),
            index,
            front: 0,
            full_slots: 0,
            slots: std::array::from_fn(|_| SmallVec::new()),
        }
    }

    /// Insert a class into the bucket for `rounded_s`.
    ///
    /// A slot offset past the ring means the caller's timestamps are
    /// inconsistent; that is a diagnostic, not a crash, so clamp to the
    /// last slot and keep going.
    pub fn slot_insert(&mut self, id: ClassId, rounded_s: u64, v: u64) {
        let mut slot = rounded_s.wrapping_sub(self.s) >> self.slot_shift;
        if slot >= QFQ_MAX_SLOTS as u64 {
            if clamp_should_log() {
                warn!(
                    group = self.index,
                    slot,
                    v,
                    rounded_s,
                    group_s = self.s,
                    full_slots = self.full_slots,
                    front = self.front,
                    "slot offset out of range, clamping"
                );
            }
            slot = QFQ_MAX_SLOTS as u64 - 1;
        }
        let i = (self.front + slot as usize) % QFQ_MAX_SLOTS;
        self.slots[i].insert(0, id);
        self.full_slots |= 1 << slot;
    }

    /// Head of the front bucket, if any.
    pub fn slot_head(&self) -> Option<ClassId> {
        self.slots[self.front].first().copied()
    }

    pub fn front_slot_is_empty(&self) -> bool {
        self.slots[self.front].is_empty()
    }

    /// Remove the head of the front bucket.
    pub fn front_slot_remove(&mut self) -> Option<ClassId> {
        let bucket = &mut self.slots[self.front];
        if bucket.is_empty() {
            return None;
        }
        let id = bucket.remove(0);
        if bucket.is_empty() {
            self.full_slots &= !1;
        }
        Some(id)
    }

    /// First class of the first non-empty bucket, rotating the ring so
    /// that bucket becomes logical slot 0.
    pub fn slot_scan(&mut self) -> Option<ClassId> {
        if self.full_slots == 0 {
            return None;
        }
        let i = self.full_slots.trailing_zeros() as usize;
        if i > 0 {
            self.front = (self.front + i) % QFQ_MAX_SLOTS;
            self.full_slots >>= i;
        }
        self.slot_head()
    }

    /// Make room when the group start moves backward to `rounded_s`: shift
    /// occupancy up and rotate `front` down so existing entries keep their
    /// buckets.
    pub fn slot_rotate(&mut self, rounded_s: u64) {
        let mut i = self.s.wrapping_sub(rounded_s) >> self.slot_shift;
        if i >= QFQ_MAX_SLOTS as u64 {
            if clamp_should_log() {
                warn!(
                    group = self.index,
                    shift_by = i,
                    rounded_s,
                    group_s = self.s,
                    "rotate distance out of range, clamping"
                );
            }
            i = QFQ_MAX_SLOTS as u64 - 1;
        }
        self.full_slots <<= i as u32;
        self.front = (self.front + QFQ_MAX_SLOTS - i as usize) % QFQ_MAX_SLOTS;
    }

    /// Remove a class from the bucket its rounded start maps to.
    pub fn slot_remove(&mut self, id: ClassId, rounded_s: u64) {
        let mut offset = rounded_s.wrapping_sub(self.s) >> self.slot_shift;
        if offset >= QFQ_MAX_SLOTS as u64 {
            offset = QFQ_MAX_SLOTS as u64 - 1;
        }
        let i = (self.front + offset as usize) % QFQ_MAX_SLOTS;
        let bucket = &mut self.slots[i];
        let found = bucket.iter().position(|&c| c == id);
        debug_assert!(found.is_some(), "class {id} not in expected slot");
        if let Some(pos) = found {
            bucket.remove(pos);
        }
        if bucket.is_empty() {
            self.full_slots &= !(1 << offset);
        }
    }

    /// All classes anywhere in the ring, in physical bucket order.
    pub fn ring_ids(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.slots.iter().flat_map(|bucket| bucket.iter().copied())
    }

    #[cfg(test)]
    pub fn bucket(&self, logical: usize) -> &[ClassId] {
        &self.slots[(self.front + logical) % QFQ_MAX_SLOTS]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> Group {
        // group 19: slot_shift 41
        Group::new(QFQ_MAX_INDEX)
    }

    const SLOT: u64 = 1 << 41;

    #[test]
    fn insert_sets_bits_and_orders_head_first() {
        let mut g = group();
        g.slot_insert(1, 0, 0);
        g.slot_insert(2, 0, 0);
        g.slot_insert(3, SLOT, 0);
        assert_eq!(g.full_slots, 0b11);
        // within a bucket, the newest insert is at the head
        assert_eq!(g.slot_head(), Some(2));
        assert_eq!(g.bucket(1), &[3]);
    }

    #[test]
    fn front_slot_remove_clears_bit_when_empty() {
        let mut g = group();
        g.slot_insert(1, 0, 0);
        g.slot_insert(2, SLOT, 0);
        assert_eq!(g.front_slot_remove(), Some(1));
        assert_eq!(g.full_slots, 0b10);
        assert_eq!(g.front_slot_remove(), None);
    }

    #[test]
    fn scan_rotates_to_first_occupied_slot() {
        let mut g = group();
        g.slot_insert(7, 3 * SLOT, 0);
        assert_eq!(g.full_slots, 0b1000);
        assert_eq!(g.slot_scan(), Some(7));
        assert_eq!(g.full_slots, 0b1);
        assert_eq!(g.front, 3);
    }

    #[test]
    fn rotate_preserves_occupancy() {
        let mut g = group();
        g.s = 4 * SLOT;
        g.slot_insert(1, 4 * SLOT, 0);
        g.slot_insert(2, 5 * SLOT, 0);
        assert_eq!(g.full_slots, 0b11);
        // start moves two slots back
        g.slot_rotate(2 * SLOT);
        assert_eq!(g.full_slots, 0b1100);
        g.s = 2 * SLOT;
        assert_eq!(g.slot_scan(), Some(1));
        assert_eq!(g.bucket(1), &[2]);
    }

    #[test]
    fn remove_from_inner_slot() {
        let mut g = group();
        g.slot_insert(1, 0, 0);
        g.slot_insert(2, 2 * SLOT, 0);
        g.slot_remove(2, 2 * SLOT);
        assert_eq!(g.full_slots, 0b1);
        g.slot_remove(1, 0);
        assert_eq!(g.full_slots, 0);
    }

    #[test]
    fn overflow_clamps_to_last_slot() {
        let mut g = group();
        g.slot_insert(1, (QFQ_MAX_SLOTS as u64 + 5) * SLOT, 0);
        assert_eq!(g.full_slots, 1 << (QFQ_MAX_SLOTS - 1));
    }
}
