//! The QFQ-RL core: group state machine plus the rate-limited virtual
//! clock.
//!
//! Everything in here is owned by a single logical consumer. The facade
//! wraps the core in a mutex so the rare control-plane operations can get
//! at it, but the dequeue path assumes it is the only mutator while it
//! runs.
//!
//! Timestamp layout and the four-state bitmap machinery follow
//! Checconi, Rizzo, Valente: "QFQ: Efficient Packet Scheduling with Tight
//! Bandwidth Distribution Guarantees". The departure from classic QFQ is
//! the clock: dequeueing records virtual-time debt that is burned in as
//! wall-clock time actually passes, so the schedule paces at the link's
//! drain rate instead of being work conserving.

use rustc_hash::FxHashMap;

use crate::packet::Packet;
use crate::stats::ewma;

use super::class::{ClassId, ClassState};
use super::clock::Clock;
use super::group::Group;
use super::timestamps::{fls64, mask_below, mask_from, qfq_gt, qfq_round_down};
use super::{NSEC_PER_SEC, ONE_FP, QFQ_MAX_INDEX, QFQ_MIN_SLOT_SHIFT};

/// Group states, used as indices into the bitmap array. The numeric values
/// matter: bit 0 is "ineligible", bit 1 is "blocked".
pub(crate) const ER: usize = 0;
pub(crate) const IR: usize = 1;
pub(crate) const EB: usize = 2;
pub(crate) const IB: usize = 3;

pub(crate) struct SchedCore {
    /// Precise virtual time.
    v: u64,
    pub(crate) wsum: u64,
    pub(crate) wsum_active: u64,
    bitmaps: [u32; 4],
    groups: [Group; QFQ_MAX_INDEX as usize + 1],
    pub(crate) classes: FxHashMap<ClassId, ClassState>,
    /// Number of classes currently slotted for service.
    pub(crate) active_classes: u32,

    /// Pacing state: when V was last advanced, and the virtual time /
    /// wall time owed by packets already handed to the device.
    v_last_updated: u64,
    v_diff_sum: u64,
    t_diff_sum: u64,

    link_speed: u64,
    /// Virtual-time units per nanosecond at full link utilisation.
    drain_rate: u64,
    clock: Box<dyn Clock>,
}

impl SchedCore {
    pub fn new(link_speed: u64, clock: Box<dyn Clock>) -> Self {
        let v_last_updated = clock.now_ns();
        SchedCore {
            v: 0,
            wsum: 0,
            wsum_active: 0,
            bitmaps: [0; 4],
            groups: std::array::from_fn(|i| Group::new(i as u32)),
            classes: FxHashMap::default(),
            active_classes: 0,
            v_last_updated,
            v_diff_sum: 0,
            t_diff_sum: 0,
            link_speed,
            drain_rate: link_speed * 125_000 * ONE_FP / NSEC_PER_SEC,
            clock,
        }
    }

    // === state machine ===

    /// State a group would be in right now: eligibility from S vs V, the
    /// blocked bit from the first ready group at a higher index.
    fn calc_state(&self, grp_idx: usize) -> usize {
        let grp = &self.groups[grp_idx];
        let mut state = usize::from(qfq_gt(grp.s, self.v));
        let mask = mask_from(self.bitmaps[ER], grp_idx as u32);
        if mask != 0 {
            let next = &self.groups[mask.trailing_zeros() as usize];
            if qfq_gt(grp.f, next.f) {
                state |= EB;
            }
        }
        state
    }

    fn move_groups(&mut self, mask: u32, src: usize, dst: usize) {
        self.bitmaps[dst] |= self.bitmaps[src] & mask;
        self.bitmaps[src] &= !mask;
    }

    /// After the group at `index` had its finish time raised from `old_f`,
    /// groups at smaller indices it was holding back may become ready.
    fn unblock_groups(&mut self, index: usize, old_f: u64) {
        let mask = mask_from(self.bitmaps[ER], index as u32 + 1);
        if mask != 0 {
            let next_f = self.groups[mask.trailing_zeros() as usize].f;
            if !qfq_gt(next_f, old_f) {
                return;
            }
        }

        let mask = (1u32 << index) - 1;
        self.move_groups(mask, EB, ER);
        self.move_groups(mask, IB, IR);
    }

    /// Promote every ineligible group whose start time V has now passed.
    /// The xor of the old and new slot numbers bounds the group indices
    /// whose slot boundaries V can have crossed.
    fn make_eligible(&mut self, old_v: u64) {
        let vslot = self.v >> QFQ_MIN_SLOT_SHIFT;
        let old_vslot = old_v >> QFQ_MIN_SLOT_SHIFT;

        if vslot != old_vslot {
            let mask = mask_below(fls64(vslot ^ old_vslot));
            self.move_groups(mask, IR, ER);
            self.move_groups(mask, IB, EB);
        }
    }

    fn update_eligible(&mut self, old_v: u64) {
        if self.bitmaps[IR] | self.bitmaps[IB] != 0 {
            // classic QFQ would first forward V to the start time of the
            // next ineligible group to keep the schedule work conserving;
            // the rate limiter deliberately does not
            self.make_eligible(old_v);
        }
    }

    // === virtual clock ===

    /// Advance V for the wall-clock time elapsed since the last call.
    ///
    /// Debt recorded by earlier dequeues is retired first, proportionally
    /// if the elapsed time does not cover all of it. Leftover time (and
    /// all time while no debt is outstanding) moves V at the drain rate,
    /// but only while nothing is eligible and ready; otherwise V would run
    /// ahead of the packets actually being served.
    pub fn update_system_time(&mut self) {
        let old_v = self.v;
        let now = self.clock.now_ns();
        if self.v_last_updated == now {
            return;
        }

        let mut t_diff = now.wrapping_sub(self.v_last_updated);
        let mut v_diff = 0u64;

        if self.t_diff_sum > 0 {
            if t_diff >= self.t_diff_sum {
                v_diff = self.v_diff_sum;
                t_diff -= self.t_diff_sum;
                self.v_diff_sum = 0;
                self.t_diff_sum = 0;
                if self.bitmaps[ER] == 0 {
                    v_diff += self.idle_advance(t_diff);
                }
            } else {
                let paid = (self.v_diff_sum as u128 * t_diff as u128
                    / self.t_diff_sum as u128) as u64;
                v_diff = paid;
                self.v_diff_sum -= paid;
                self.t_diff_sum -= t_diff;
            }
        } else if self.bitmaps[ER] == 0 {
            v_diff = self.idle_advance(t_diff);
        }

        self.v = self.v.wrapping_add(v_diff);
        self.v_last_updated = now;

        self.update_eligible(old_v);
    }

    fn idle_advance(&self, t_diff: u64) -> u64 {
        let denom = self.link_speed.max(self.wsum_active);
        (self.drain_rate as u128 * t_diff as u128 / denom as u128) as u64
    }

    // === activation ===

    /// Pick a start time for a class becoming backlogged.
    ///
    /// A finish time still ahead of V carries over (S = F). A stale one
    /// (F already passed, or absurdly far out after a wraparound) restarts
    /// at V, except that jumping to V could slip the class in front of a
    /// ready group it ought to queue behind, in which case it starts at
    /// that group's finish time instead.
    fn update_start(&mut self, id: ClassId) {
        let cl = &self.classes[&id];
        let grp_idx = cl.grp_idx as usize;
        let slot_shift = self.groups[grp_idx].slot_shift;

        let rounded_f = qfq_round_down(cl.f, slot_shift);
        let limit = qfq_round_down(self.v, slot_shift).wrapping_add(1u64 << slot_shift);

        let new_s = if !qfq_gt(cl.f, self.v) || qfq_gt(rounded_f, limit) {
            // timestamp was stale
            let mask = mask_from(self.bitmaps[ER], grp_idx as u32);
            let mut s = self.v;
            if mask != 0 {
                let next = &self.groups[mask.trailing_zeros() as usize];
                if qfq_gt(rounded_f, next.f) {
                    s = if qfq_gt(limit, next.f) { next.f } else { limit };
                }
            }
            s
        } else {
            cl.f
        };

        self.classes.get_mut(&id).unwrap().s = new_s;
    }

    /// Slot a class that just went from empty to backlogged. The caller
    /// accounts `wsum_active` and the active-class count.
    pub fn activate_class(&mut self, id: ClassId, pkt_len: u32) {
        self.update_start(id);

        let (cl_s, grp_idx) = {
            let cl = self.classes.get_mut(&id).unwrap();
            cl.f = cl.s.wrapping_add(pkt_len as u64 * cl.inv_w);
            cl.active = true;
            (cl.s, cl.grp_idx as usize)
        };
        let shift = self.groups[grp_idx].slot_shift;
        let rounded_s = qfq_round_down(cl_s, shift);

        // If the group start moves backward we must make room in the ring
        // and recompute the group state; otherwise the existing state
        // stands and this is a plain insert.
        let mut needs_update = true;
        if self.groups[grp_idx].full_slots != 0 {
            if !qfq_gt(self.groups[grp_idx].s, cl_s) {
                needs_update = false;
            } else {
                self.groups[grp_idx].slot_rotate(rounded_s);
                self.bitmaps[IR] &= !(1u32 << grp_idx);
                self.bitmaps[IB] &= !(1u32 << grp_idx);
            }
        }

        if needs_update {
            {
                let grp = &mut self.groups[grp_idx];
                grp.s = rounded_s;
                grp.f = rounded_s.wrapping_add(2u64 << shift);
            }
            let state = self.calc_state(grp_idx);
            self.bitmaps[state] |= 1u32 << grp_idx;
            trace!(
                group = grp_idx,
                state,
                s = cl_s,
                v = self.v,
                "class activated"
            );
        }

        let v = self.v;
        self.groups[grp_idx].slot_insert(id, rounded_s, v);
    }

    /// Pull a class out of the slot structure, propagating the change to
    /// the group state if it was at the front. The caller accounts
    /// `wsum_active` and the active-class count.
    pub fn deactivate_class(&mut self, id: ClassId) {
        let (rounded_s, grp_idx) = {
            let cl = self.classes.get_mut(&id).unwrap();
            cl.f = cl.s;
            cl.active = false;
            let shift = self.groups[cl.grp_idx as usize].slot_shift;
            (qfq_round_down(cl.s, shift), cl.grp_idx as usize)
        };

        self.groups[grp_idx].slot_remove(id, rounded_s);

        let own = 1u32 << grp_idx;
        if self.groups[grp_idx].full_slots == 0 {
            self.bitmaps[IR] &= !own;
            self.bitmaps[EB] &= !own;
            self.bitmaps[IB] &= !own;

            if self.bitmaps[ER] & own != 0
                && mask_from(self.bitmaps[ER] & !own, grp_idx as u32) == 0
            {
                // the last ready group at this index or above is leaving:
                // everything from the highest remaining ready group up is
                // no longer held back
                let lower = self.bitmaps[ER] & (own - 1);
                let mask = if lower != 0 {
                    !((1u32 << (31 - lower.leading_zeros())) - 1)
                } else {
                    !0u32
                };
                self.move_groups(mask, EB, ER);
                self.move_groups(mask, IB, IR);
            }
            self.bitmaps[ER] &= !own;
        } else if self.groups[grp_idx].front_slot_is_empty() {
            if let Some(head) = self.groups[grp_idx].slot_scan() {
                let head_s = self.classes[&head].s;
                let shift = self.groups[grp_idx].slot_shift;
                let rounded = qfq_round_down(head_s, shift);
                if self.groups[grp_idx].s != rounded {
                    for bitmap in &mut self.bitmaps {
                        *bitmap &= !own;
                    }
                    {
                        let grp = &mut self.groups[grp_idx];
                        grp.s = rounded;
                        grp.f = rounded.wrapping_add(2u64 << shift);
                    }
                    let state = self.calc_state(grp_idx);
                    self.bitmaps[state] |= own;
                }
            }
        }

        let v = self.v;
        self.update_eligible(v);
    }

    // === dequeue ===

    /// Update the served class after one packet left it. Returns true if
    /// the group needs its own update: the class emptied, lost its weight,
    /// or moved to another slot.
    fn update_class(&mut self, grp_idx: usize, id: ClassId, next_len: u32) -> bool {
        let (cl_s, inv_w) = {
            let cl = self.classes.get_mut(&id).unwrap();
            cl.s = cl.f;
            (cl.s, cl.inv_w)
        };

        if next_len == 0 || inv_w == ONE_FP + 1 {
            // drained, or the weight was zeroed while it waited
            self.groups[grp_idx].front_slot_remove();
            return true;
        }

        let shift = self.groups[grp_idx].slot_shift;
        self.classes.get_mut(&id).unwrap().f =
            cl_s.wrapping_add(next_len as u64 * inv_w);

        let rounded_s = qfq_round_down(cl_s, shift);
        if rounded_s == self.groups[grp_idx].s {
            return false;
        }

        let v = self.v;
        let grp = &mut self.groups[grp_idx];
        grp.front_slot_remove();
        grp.slot_insert(id, rounded_s, v);
        true
    }

    fn class_went_idle(&mut self, id: ClassId) {
        let cl = self.classes.get_mut(&id).unwrap();
        cl.active = false;
        let weight = cl.weight();
        self.wsum_active -= weight;
    }

    /// Feed the class rate estimator with one dequeued packet.
    fn record_rate(&mut self, id: ClassId, len: u64) {
        let now = self.v_last_updated;
        let cl = self.classes.get_mut(&id).unwrap();
        let dt = now.wrapping_sub(cl.last_deq_ns);
        if cl.last_deq_ns != 0 && dt > 0 {
            let inst = len * 8 * NSEC_PER_SEC / dt;
            cl.rate_bps = ewma(cl.rate_bps, inst);
            cl.channel
                .counters
                .rate_bps
                .store(cl.rate_bps, std::sync::atomic::Ordering::Relaxed);
        }
        cl.last_deq_ns = now;
    }

    /// Serve one packet from the leading ready group, or nothing if the
    /// rate limiter says the link has no credit yet.
    pub fn dequeue(&mut self) -> Option<Packet> {
        self.update_system_time();
        let old_v = self.v;

        if self.bitmaps[ER] == 0 {
            return None;
        }
        let grp_idx = self.bitmaps[ER].trailing_zeros() as usize;

        let Some(id) = self.groups[grp_idx].slot_head() else {
            error!(group = grp_idx, "ready group has an empty front slot");
            self.bitmaps[ER] &= !(1u32 << grp_idx);
            return None;
        };

        let Some(cl) = self.classes.get(&id) else {
            // table and ring out of sync; drop the orphan entry instead of
            // serving it forever
            error!(class = id, "slotted class missing from the class table");
            self.groups[grp_idx].front_slot_remove();
            return None;
        };
        let channel = cl.channel.clone();
        let (pkt, cl_qlen, next_len) = {
            let mut queue = channel.queue.lock();
            let pkt = queue.dequeue_peeked();
            let qlen = queue.len();
            let next_len = if pkt.is_some() && qlen > 0 {
                queue.peek_len()
            } else {
                0
            };
            (pkt, qlen, next_len)
        };

        let Some(pkt) = pkt else {
            warn!(class = id, "backlogged class yielded no packet");
            return None;
        };

        if cl_qlen == 0 {
            self.active_classes -= 1;
        }

        let len = pkt.len() as u64;
        self.record_rate(id, len);

        // Defer the V advance for this packet to real time: record how
        // much V it is worth and how long its transmission should take.
        let denom = self.link_speed.max(self.wsum_active);
        self.v_diff_sum += len * ONE_FP / denom;
        self.t_diff_sum += len * NSEC_PER_SEC / (125_000 * self.link_speed);

        let went_idle = cl_qlen == 0;
        if self.update_class(grp_idx, id, next_len) {
            let old_f = self.groups[grp_idx].f;

            if went_idle {
                self.class_went_idle(id);
            }

            let mut unblock = true;
            match self.groups[grp_idx].slot_scan() {
                None => {
                    self.bitmaps[ER] &= !(1u32 << grp_idx);
                }
                Some(head) => {
                    let head_s = self.classes[&head].s;
                    let shift = self.groups[grp_idx].slot_shift;
                    let rounded_s = qfq_round_down(head_s, shift);
                    if self.groups[grp_idx].s == rounded_s {
                        unblock = false;
                    } else {
                        {
                            let grp = &mut self.groups[grp_idx];
                            grp.s = rounded_s;
                            grp.f = rounded_s.wrapping_add(2u64 << shift);
                        }
                        self.bitmaps[ER] &= !(1u32 << grp_idx);
                        let state = self.calc_state(grp_idx);
                        self.bitmaps[state] |= 1u32 << grp_idx;
                    }
                }
            }
            if unblock {
                self.unblock_groups(grp_idx, old_f);
            }
        } else if went_idle {
            self.class_went_idle(id);
        }

        self.update_eligible(old_v);

        Some(pkt)
    }

    // === maintenance ===

    /// Reclaim one packet from some backlogged class. Slotted classes are
    /// tried first; classes that never reached the slot structure (weight
    /// zero, or activation still in flight) are the fallback so their
    /// backlog stays reclaimable.
    pub fn drop_one(&mut self) -> u32 {
        for grp_idx in 0..self.groups.len() {
            let ids: Vec<ClassId> = self.groups[grp_idx].ring_ids().collect();
            for id in ids {
                if let Some(len) = self.try_drop(id, true) {
                    return len;
                }
            }
        }

        let ids: Vec<ClassId> = self.classes.keys().copied().collect();
        for id in ids {
            if let Some(len) = self.try_drop(id, false) {
                return len;
            }
        }
        0
    }

    fn try_drop(&mut self, id: ClassId, slotted: bool) -> Option<u32> {
        let channel = self.classes.get(&id)?.channel.clone();
        let (len, qlen) = {
            let mut queue = channel.queue.lock();
            (queue.drop_one(), queue.len())
        };
        if len == 0 {
            return None;
        }
        channel.counters.on_drop();
        if slotted && qlen == 0 {
            let weight = self.classes[&id].weight();
            self.deactivate_class(id);
            self.wsum_active -= weight;
            self.active_classes -= 1;
        }
        Some(len)
    }

    /// Tear down all runtime state: every class out of the slot rings,
    /// every sub-queue emptied, pacing debt forgiven.
    pub fn reset(&mut self) {
        let active: Vec<ClassId> = self
            .classes
            .iter()
            .filter(|(_, cl)| cl.active)
            .map(|(id, _)| *id)
            .collect();
        for id in active {
            self.deactivate_class(id);
        }

        for cl in self.classes.values_mut() {
            cl.channel.queue.lock().reset();
        }

        self.wsum_active = 0;
        self.active_classes = 0;
        self.v_diff_sum = 0;
        self.t_diff_sum = 0;
    }

    // === consistency checks (exercised by the test suite) ===

    /// Structural invariants: bitmap disjointness and membership, slot
    /// alignment of group timestamps, weight-sum bookkeeping, and the
    /// eligibility bit of every stored state.
    #[cfg(test)]
    pub fn assert_invariants(&self) {
        for i in 0..4 {
            for j in (i + 1)..4 {
                assert_eq!(
                    self.bitmaps[i] & self.bitmaps[j],
                    0,
                    "bitmaps {i} and {j} overlap: {:#x?}",
                    self.bitmaps
                );
            }
        }

        let any = self.bitmaps.iter().fold(0, |acc, b| acc | b);
        for grp in &self.groups {
            let bit = 1u32 << grp.index;
            if grp.full_slots != 0 {
                assert_ne!(any & bit, 0, "group {} occupied but stateless", grp.index);
                assert_eq!(
                    grp.s & ((1u64 << grp.slot_shift) - 1),
                    0,
                    "group {} start not slot aligned",
                    grp.index
                );
                assert_eq!(
                    grp.f.wrapping_sub(grp.s),
                    2u64 << grp.slot_shift,
                    "group {} span wrong",
                    grp.index
                );

                let eligible = !qfq_gt(grp.s, self.v);
                let in_eligible = (self.bitmaps[ER] | self.bitmaps[EB]) & bit != 0;
                assert_eq!(
                    eligible, in_eligible,
                    "group {} eligibility bit inconsistent",
                    grp.index
                );
            } else {
                assert_eq!(any & bit, 0, "group {} empty but in a state", grp.index);
            }
        }

        let wsum: u64 = self.classes.values().map(|cl| ONE_FP / cl.inv_w).sum();
        assert_eq!(wsum, self.wsum, "wsum out of sync");
        let wsum_active: u64 = self
            .classes
            .values()
            .filter(|cl| cl.active)
            .map(|cl| ONE_FP / cl.inv_w)
            .sum();
        assert_eq!(wsum_active, self.wsum_active, "wsum_active out of sync");

        let active = self.classes.values().filter(|cl| cl.active).count() as u32;
        assert_eq!(active, self.active_classes, "active class count out of sync");
    }

    /// Full state recomputation, including the blocked bit. Used by the
    /// directed tests whose dynamics are simple enough to pin exactly.
    #[cfg(test)]
    pub fn assert_states_exact(&self) {
        self.assert_invariants();
        for grp_idx in 0..self.groups.len() {
            let bit = 1u32 << grp_idx;
            let Some(stored) = (0..4).find(|&s| self.bitmaps[s] & bit != 0) else {
                continue;
            };
            let grp = &self.groups[grp_idx];
            let mut state = usize::from(qfq_gt(grp.s, self.v));
            let mask = mask_from(self.bitmaps[ER] & !bit, grp_idx as u32);
            if mask != 0 {
                let next = &self.groups[mask.trailing_zeros() as usize];
                if qfq_gt(grp.f, next.f) {
                    state |= EB;
                }
            }
            assert_eq!(
                state, stored,
                "group {grp_idx} stored state {stored} != recomputed {state}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::packet::Packet;
    use crate::fifo::TailDropFifo;

    use super::super::clock::ManualClock;
    use super::super::class::{ClassChannel, ClassState};
    use super::super::LINK_SPEED;
    use super::*;

    fn new_core() -> (SchedCore, ManualClock) {
        let clock = ManualClock::new();
        let core = SchedCore::new(LINK_SPEED, Box::new(clock.clone()));
        (core, clock)
    }

    fn add_class(core: &mut SchedCore, id: ClassId, weight: u64, lmax: u32) {
        let inv_w = if weight == 0 { ONE_FP + 1 } else { ONE_FP / weight };
        let channel = Arc::new(ClassChannel::new(
            Box::new(TailDropFifo::new(100_000)),
            inv_w,
        ));
        core.classes.insert(id, ClassState::new(inv_w, lmax, channel));
        core.wsum += ONE_FP / inv_w;
    }

    fn enqueue(core: &mut SchedCore, id: ClassId, len: usize) {
        let (inv_w, active, channel) = {
            let cl = &core.classes[&id];
            (cl.inv_w, cl.active, cl.channel.clone())
        };
        let newly_backlogged = {
            let mut queue = channel.queue.lock();
            queue.enqueue(Packet::new(id, vec![0; len])).unwrap();
            queue.len() == 1
        };
        if newly_backlogged && !active && inv_w != ONE_FP + 1 {
            core.activate_class(id, len as u32);
            core.wsum_active += ONE_FP / inv_w;
            core.active_classes += 1;
        }
    }

    /// Drive dequeue until `want` packets came out. Checks the structural
    /// invariants after every step; the full state recomputation is only
    /// asserted by single-group tests, because the unblock path promotes
    /// blocked groups optimistically (as the state machine always has)
    /// and a recomputation can transiently disagree across groups.
    fn pump(
        core: &mut SchedCore,
        clock: &ManualClock,
        want: usize,
        step_ns: u64,
        max_iters: usize,
    ) -> Vec<Packet> {
        let mut out = Vec::new();
        for _ in 0..max_iters {
            match core.dequeue() {
                Some(pkt) => out.push(pkt),
                None => clock.advance(step_ns),
            }
            core.assert_invariants();
            if out.len() == want {
                break;
            }
        }
        out
    }

    #[test]
    fn fresh_activation_is_eligible_and_ready() {
        let (mut core, _clock) = new_core();
        add_class(&mut core, 1, 1, 1500);
        enqueue(&mut core, 1, 1500);

        assert_eq!(core.bitmaps[ER], 1 << 19);
        assert_eq!(core.wsum_active, 1);
        assert_eq!(core.active_classes, 1);
        core.assert_states_exact();
    }

    #[test]
    fn drains_backlog_and_deactivates() {
        let (mut core, clock) = new_core();
        add_class(&mut core, 1, 1, 1500);
        for _ in 0..3 {
            enqueue(&mut core, 1, 1500);
        }

        let got = pump(&mut core, &clock, 3, 1_000_000, 100_000);
        assert_eq!(got.len(), 3);
        assert_eq!(core.bitmaps, [0; 4]);
        assert_eq!(core.wsum_active, 0);
        assert_eq!(core.active_classes, 0);
        assert!(!core.classes[&1].active);
    }

    #[test]
    fn dequeue_pauses_until_time_passes() {
        let (mut core, clock) = new_core();
        add_class(&mut core, 1, 1, 1500);
        for _ in 0..100 {
            enqueue(&mut core, 1, 1500);
        }

        // with a frozen clock only the first couple of packets (one slot's
        // worth) come out before the class outruns V
        let mut burst = 0;
        while core.dequeue().is_some() {
            burst += 1;
            assert!(burst <= 4, "rate limiter never engaged");
        }
        assert!(burst >= 1);
        core.assert_states_exact();

        // nothing budges while time is frozen
        assert!(core.dequeue().is_none());

        // one second is worth far more than the remaining backlog
        clock.advance(NSEC_PER_SEC);
        assert!(core.dequeue().is_some());
    }

    #[test]
    fn two_groups_split_service_by_weight() {
        let (mut core, clock) = new_core();
        add_class(&mut core, 1, 2, 1500);
        add_class(&mut core, 2, 1, 1500);
        for _ in 0..40 {
            enqueue(&mut core, 1, 1500);
            enqueue(&mut core, 2, 1500);
        }

        let got = pump(&mut core, &clock, 60, 1_000_000, 200_000);
        assert_eq!(got.len(), 60);

        let a: usize = got.iter().filter(|p| p.priority == 1).count();
        // 2:1 split, one-packet slop on either side
        assert!((37..=43).contains(&a), "a = {a}");
    }

    #[test]
    fn reactivation_after_idle_reuses_stale_timestamp_path() {
        let (mut core, clock) = new_core();
        add_class(&mut core, 1, 1, 1500);
        enqueue(&mut core, 1, 1500);
        let got = pump(&mut core, &clock, 1, 1_000_000, 10_000);
        assert_eq!(got.len(), 1);
        assert_eq!(core.active_classes, 0);

        // long idle gap: the old finish time is far behind V
        clock.advance(10 * NSEC_PER_SEC);
        enqueue(&mut core, 1, 1500);
        core.assert_states_exact();
        let got = pump(&mut core, &clock, 1, 1_000_000, 10_000);
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn drop_one_deactivates_emptied_class() {
        let (mut core, _clock) = new_core();
        add_class(&mut core, 1, 1, 1500);
        enqueue(&mut core, 1, 1000);

        assert_eq!(core.drop_one(), 1000);
        assert_eq!(core.active_classes, 0);
        assert_eq!(core.wsum_active, 0);
        assert_eq!(core.bitmaps, [0; 4]);
        core.assert_states_exact();

        assert_eq!(core.drop_one(), 0);
    }

    #[test]
    fn reset_clears_runtime_state() {
        let (mut core, clock) = new_core();
        add_class(&mut core, 1, 1, 1500);
        add_class(&mut core, 2, 4, 800);
        for _ in 0..5 {
            enqueue(&mut core, 1, 1500);
            enqueue(&mut core, 2, 700);
        }
        let _ = pump(&mut core, &clock, 3, 1_000_000, 10_000);

        core.reset();
        assert_eq!(core.bitmaps, [0; 4]);
        assert_eq!(core.active_classes, 0);
        assert_eq!(core.wsum_active, 0);
        for cl in core.classes.values() {
            assert!(!cl.active);
            assert_eq!(cl.channel.qlen(), 0);
        }
        // the weight configuration survives a reset
        assert_eq!(core.wsum, 5);
    }

    #[test]
    fn randomized_ops_hold_invariants() {
        let (mut core, clock) = new_core();
        let weights: [(ClassId, u64, u32); 6] = [
            (1, 1, 1500),
            (2, 2, 1500),
            (3, 7, 1200),
            (4, 64, 2048),
            (5, 512, 300),
            (6, 16384, 1500),
        ];
        for (id, w, lmax) in weights {
            add_class(&mut core, id, w, lmax);
        }

        let mut rng = StdRng::seed_from_u64(0x9fc1_77e3);
        for _ in 0..20_000 {
            match rng.gen_range(0..10) {
                0..=3 => {
                    let (id, _, lmax) = weights[rng.gen_range(0..weights.len())];
                    let len = rng.gen_range(60..=lmax as usize);
                    enqueue(&mut core, id, len);
                }
                4..=7 => {
                    let _ = core.dequeue();
                }
                8 => {
                    clock.advance(rng.gen_range(100..5_000_000));
                }
                _ => {
                    let _ = core.drop_one();
                }
            }
            core.assert_invariants();
        }
    }
}
