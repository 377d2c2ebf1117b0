//! Quick Fair Queueing scheduler with rate limitation.
//!
//! Classes are grouped by the octave of their per-packet virtual-time
//! cost, `log2(lmax / weight)`, so every group advances in fixed
//! slot-aligned steps and the scheduler picks the next class with a few
//! bitmap operations. See Checconi, Rizzo, Valente: "QFQ: Efficient
//! Packet Scheduling with Tight Bandwidth Distribution Guarantees".
//!
//! Virtual times are fixed point with `FRAC_BITS` fractional bits:
//!
//! ```text
//!              [ MTU_SHIFT ][      FRAC_BITS    ]
//!              [ MAX_INDEX    ][ MIN_SLOT_SHIFT ]
//! ```
//!
//! Because weights also divide the virtual clock by
//! `max(LINK_SPEED, wsum_active)`, a weight doubles as the class's rate
//! limit in Mbit/s while the sum of backlogged weights stays below the
//! link speed.
//!
//! Concurrency model: producers classify and append to per-class
//! sub-queues, publishing a small activation event when a class goes from
//! empty to backlogged. One consumer — normally the [`Spinner`] — drains
//! those events and runs dequeue. The core state sits behind a mutex the
//! consumer takes once per iteration; the rare control-plane calls
//! (class admission, reconfiguration, deletion) take the same mutex, and
//! producers never do.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;

use crate::classify::{Classifier, PriorityClassifier, Verdict};
use crate::fifo::{SubQueue, TailDropFifo};
use crate::packet::Packet;
use crate::stats::{ClassStats, SchedStats};

mod activation;
mod class;
mod clock;
mod engine;
mod group;
mod spinner;
mod timestamps;

pub use class::ClassId;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use spinner::Spinner;

use activation::{ActivationEvent, ActivationQueues};
use class::{calc_index, ClassChannel, ClassState};
use engine::SchedCore;

/// Slots per group; must fit one machine word of bit operations.
pub const QFQ_MAX_SLOTS: usize = 32;
/// Highest group index; one bitmap bit per index.
pub const QFQ_MAX_INDEX: u32 = 19;
pub const QFQ_MAX_WSHIFT: u32 = 16;
pub const QFQ_MAX_WEIGHT: u32 = 1 << QFQ_MAX_WSHIFT;
pub const QFQ_MAX_WSUM: u64 = 2 * QFQ_MAX_WEIGHT as u64;

/// Fixed-point fractional bits of all virtual times.
pub const FRAC_BITS: u32 = 30;
pub const ONE_FP: u64 = 1 << FRAC_BITS;

pub const QFQ_MTU_SHIFT: u32 = 11;
pub const QFQ_MIN_SLOT_SHIFT: u32 = FRAC_BITS + QFQ_MTU_SHIFT - QFQ_MAX_INDEX;

/// Default pacing target in Mbit/s. Nominally a 10G link, held a little
/// under the 9844 Mb/s of payload a 1500-byte MTU can carry once the
/// preamble, FCS and inter-packet gap are paid for, to keep device queues
/// short.
pub const LINK_SPEED: u64 = 9800;

pub(crate) const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Admission errors. Scheduler state is untouched when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid weight {0} (max {QFQ_MAX_WEIGHT})")]
    InvalidWeight(u32),
    #[error("invalid max packet length {0}")]
    InvalidLmax(u32),
    #[error("total weight out of range ({0} over budget)")]
    WeightSumOverflow(u64),
    #[error("class {0} already exists")]
    ClassExists(ClassId),
    #[error("class {0} does not exist")]
    UnknownClass(ClassId),
}

/// Enqueue-side drops.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("no class matched the packet")]
    NoMatch,
    #[error("classifier bypassed this scheduler")]
    Bypass,
    #[error("classifier consumed the packet")]
    Stolen,
    #[error("classifier shot the packet")]
    Shot,
    #[error("class sub-queue overlimit")]
    Overlimit,
}

/// Per-class admission parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassParams {
    /// Weight in [0, QFQ_MAX_WEIGHT]; also the class rate limit in
    /// Mbit/s. 0 admits the class but never schedules it.
    pub weight: u32,
    /// Maximum packet size in [1, 1 << QFQ_MTU_SHIFT].
    pub lmax: u32,
}

impl Default for ClassParams {
    fn default() -> Self {
        ClassParams {
            weight: 1,
            lmax: 1 << QFQ_MTU_SHIFT,
        }
    }
}

impl ClassParams {
    pub fn new(weight: u32, lmax: u32) -> Self {
        ClassParams { weight, lmax }
    }

    fn validate(&self) -> Result<(u64, u32), ConfigError> {
        if self.weight > QFQ_MAX_WEIGHT {
            return Err(ConfigError::InvalidWeight(self.weight));
        }
        if self.lmax == 0 || self.lmax > 1 << QFQ_MTU_SHIFT {
            return Err(ConfigError::InvalidLmax(self.lmax));
        }
        let inv_w = if self.weight == 0 {
            ONE_FP + 1
        } else {
            ONE_FP / self.weight as u64
        };
        Ok((inv_w, self.lmax))
    }
}

/// Scheduler-wide configuration.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Pacing target in Mbit/s.
    pub link_speed: u64,
    /// Number of producer shards for activation events (max 64).
    pub shards: usize,
    /// CPU the spinner is pinned to; None leaves it floating.
    pub spin_cpu: Option<usize>,
    /// Packet depth of the default per-class sub-queue.
    pub queue_limit: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            link_speed: LINK_SPEED,
            shards: 4,
            spin_cpu: Some(2),
            queue_limit: 1000,
        }
    }
}

struct Shared {
    core: Mutex<SchedCore>,
    /// Producer-visible registry: class id to shared channel.
    registry: DashMap<ClassId, Arc<ClassChannel>>,
    activation: ActivationQueues,
    classifier: Box<dyn Classifier>,
    /// Mirror of the core's active-class count so the spinner's wait loop
    /// does not need the core lock.
    active_hint: AtomicU32,
    /// Packets dropped before reaching any sub-queue plus sub-queue
    /// rejections.
    drops: AtomicU64,
    next_shard: AtomicUsize,
    queue_limit: usize,
    spin_cpu: Option<usize>,
}

/// The scheduler facade. Cheap to clone; all clones share one scheduler.
#[derive(Clone)]
pub struct QfqSched {
    shared: Arc<Shared>,
}

impl QfqSched {
    pub fn new(config: SchedConfig) -> Self {
        Self::with_clock(config, Box::new(MonotonicClock::default()))
    }

    /// Build with an explicit clock; the manual clock makes pacing
    /// deterministic for tests.
    pub fn with_clock(config: SchedConfig, clock: Box<dyn Clock>) -> Self {
        Self::build(config, clock, Box::new(PriorityClassifier))
    }

    pub fn with_classifier(
        config: SchedConfig,
        clock: Box<dyn Clock>,
        classifier: Box<dyn Classifier>,
    ) -> Self {
        Self::build(config, clock, classifier)
    }

    fn build(
        config: SchedConfig,
        clock: Box<dyn Clock>,
        classifier: Box<dyn Classifier>,
    ) -> Self {
        QfqSched {
            shared: Arc::new(Shared {
                core: Mutex::new(SchedCore::new(config.link_speed, clock)),
                registry: DashMap::new(),
                activation: ActivationQueues::new(config.shards),
                classifier,
                active_hint: AtomicU32::new(0),
                drops: AtomicU64::new(0),
                next_shard: AtomicUsize::new(0),
                queue_limit: config.queue_limit,
                spin_cpu: config.spin_cpu,
            }),
        }
    }

    // === class admission ===

    /// Admit a class with the default tail-drop sub-queue.
    pub fn create_class(&self, id: ClassId, params: ClassParams) -> Result<(), ConfigError> {
        let queue = Box::new(TailDropFifo::new(self.shared.queue_limit));
        self.create_class_with_queue(id, params, queue)
    }

    /// Admit a class with a caller-provided sub-queue implementation.
    pub fn create_class_with_queue(
        &self,
        id: ClassId,
        params: ClassParams,
        queue: Box<dyn SubQueue>,
    ) -> Result<(), ConfigError> {
        let (inv_w, lmax) = params.validate()?;
        let weight = ONE_FP / inv_w;

        let mut core = self.shared.core.lock();
        if core.classes.contains_key(&id) {
            return Err(ConfigError::ClassExists(id));
        }
        if core.wsum + weight > QFQ_MAX_WSUM {
            return Err(ConfigError::WeightSumOverflow(core.wsum + weight));
        }

        let channel = Arc::new(ClassChannel::new(queue, inv_w));
        core.classes
            .insert(id, ClassState::new(inv_w, lmax, channel.clone()));
        core.wsum += weight;
        drop(core);

        self.shared.registry.insert(id, channel);
        debug!(class = id, weight, lmax, "class created");
        Ok(())
    }

    /// Reconfigure a class. Identical parameters are a no-op. A change
    /// that moves a backlogged class to another group pulls its finish
    /// time back to its start (the half-served head packet is not
    /// charged), deactivates it from the old group and reactivates it in
    /// the new one with the current head length.
    pub fn change_class(&self, id: ClassId, params: ClassParams) -> Result<(), ConfigError> {
        let (inv_w, lmax) = params.validate()?;
        let new_weight = ONE_FP / inv_w;

        let mut core = self.shared.core.lock();
        let Some(cl) = core.classes.get(&id) else {
            return Err(ConfigError::UnknownClass(id));
        };
        let old_inv_w = cl.inv_w;
        let old_weight = ONE_FP / old_inv_w;
        let was_active = cl.active;
        let channel = cl.channel.clone();

        let delta = new_weight as i64 - old_weight as i64;
        if (core.wsum as i64 + delta) as u64 > QFQ_MAX_WSUM {
            return Err(ConfigError::WeightSumOverflow(
                (core.wsum as i64 + delta) as u64,
            ));
        }
        if cl.lmax == lmax && old_inv_w == inv_w {
            return Ok(());
        }

        let new_idx = calc_index(inv_w, lmax);
        let mut need_reactivation = false;

        // a move to another group, or losing the weight entirely, takes
        // the class out of its current slot
        if was_active && (new_idx != cl.grp_idx || inv_w == ONE_FP + 1) {
            // do not charge the class for the packet it never finished
            let cl = core.classes.get_mut(&id).unwrap();
            cl.f = cl.s;
            core.deactivate_class(id);
            if inv_w != ONE_FP + 1 {
                need_reactivation = true;
            }
        }
        if old_inv_w == ONE_FP + 1 && inv_w != ONE_FP + 1 {
            need_reactivation = true;
        }

        {
            let cl = core.classes.get_mut(&id).unwrap();
            cl.inv_w = inv_w;
            cl.lmax = lmax;
            cl.grp_idx = new_idx;
        }
        channel.inv_w.store(inv_w, Ordering::Release);
        core.wsum = (core.wsum as i64 + delta) as u64;

        let mut is_active = core.classes[&id].active;
        if need_reactivation && !is_active {
            let head_len = channel.peek_len();
            if head_len > 0 {
                core.activate_class(id, head_len);
                is_active = true;
            }
        }

        match (was_active, is_active) {
            (true, true) => {
                core.wsum_active = (core.wsum_active as i64 + delta) as u64;
            }
            (true, false) => {
                core.wsum_active -= old_weight;
                core.active_classes -= 1;
            }
            (false, true) => {
                core.wsum_active += new_weight;
                core.active_classes += 1;
            }
            (false, false) => {}
        }

        let active = core.active_classes;
        drop(core);
        self.shared.active_hint.store(active, Ordering::Release);
        debug!(class = id, weight = params.weight, lmax, "class changed");
        Ok(())
    }

    /// Remove a class, deactivating it and purging its sub-queue.
    pub fn delete_class(&self, id: ClassId) -> Result<(), ConfigError> {
        let mut core = self.shared.core.lock();
        let Some(cl) = core.classes.get(&id) else {
            return Err(ConfigError::UnknownClass(id));
        };
        let weight = cl.weight();
        let was_active = cl.active;
        let channel = cl.channel.clone();

        if was_active {
            core.deactivate_class(id);
            core.wsum_active -= weight;
            core.active_classes -= 1;
        }
        core.wsum -= weight;
        core.classes.remove(&id);

        let active = core.active_classes;
        drop(core);

        self.shared.registry.remove(&id);
        // stale cached handles keep enqueueing into the orphan queue; the
        // sentinel stops them from publishing activations for it
        channel.inv_w.store(ONE_FP + 1, Ordering::Release);
        channel.queue.lock().reset();
        self.shared.active_hint.store(active, Ordering::Release);
        debug!(class = id, "class deleted");
        Ok(())
    }

    // === producer side ===

    /// Check out an enqueue handle. Each handle is bound to one
    /// activation shard; give each producer thread its own.
    pub fn handle(&self) -> ProducerHandle {
        let shard = self.shared.next_shard.fetch_add(1, Ordering::Relaxed)
            % self.shared.activation.shard_count();
        ProducerHandle {
            shared: self.shared.clone(),
            shard,
            cache: None,
        }
    }

    // === consumer side ===

    /// Apply pending activation events to the scheduler state. Runs on
    /// the consumer before each dequeue round.
    pub fn drain_activations(&self) {
        if !self.shared.activation.work_pending() {
            return;
        }

        let mut core = self.shared.core.lock();
        core.update_system_time();

        let mut events = Vec::new();
        for shard in 0..self.shared.activation.shard_count() {
            events.clear();
            if !self.shared.activation.drain_shard(shard, &mut events) {
                continue;
            }
            for ev in &events {
                // the class may have been deleted, drained, zero-weighted
                // or already slotted since the event was published
                let (active, inv_w, qlen) = match core.classes.get(&ev.class_id) {
                    None => continue,
                    Some(cl) => (cl.active, cl.inv_w, cl.channel.qlen()),
                };
                if active || inv_w == ONE_FP + 1 || qlen == 0 {
                    continue;
                }
                let weight = ONE_FP / inv_w;
                core.activate_class(ev.class_id, ev.pkt_len);
                core.wsum_active += weight;
                core.active_classes += 1;
            }
        }

        let active = core.active_classes;
        drop(core);
        self.shared.active_hint.store(active, Ordering::Release);
    }

    /// Serve one packet, or None when nothing is eligible yet.
    pub fn dequeue(&self) -> Option<Packet> {
        let mut core = self.shared.core.lock();
        let pkt = core.dequeue();
        let active = core.active_classes;
        drop(core);
        self.shared.active_hint.store(active, Ordering::Release);
        pkt
    }

    /// Reclaim one packet from some backlogged class, returning the bytes
    /// freed.
    pub fn drop_one(&self) -> u32 {
        let mut core = self.shared.core.lock();
        let len = core.drop_one();
        let active = core.active_classes;
        drop(core);
        self.shared.active_hint.store(active, Ordering::Release);
        len
    }

    /// Deactivate every class and purge all queues and pending events.
    pub fn reset(&self) {
        self.shared.activation.clear();
        let mut core = self.shared.core.lock();
        core.reset();
        drop(core);
        self.shared.active_hint.store(0, Ordering::Release);
    }

    /// Spawn the dedicated consumer thread feeding `tx`.
    pub fn spawn_spinner(&self, tx: Box<dyn crate::transmit::TxSink>) -> Spinner {
        Spinner::spawn(self.clone(), tx, self.shared.spin_cpu)
    }

    pub(crate) fn has_work(&self) -> bool {
        self.shared.active_hint.load(Ordering::Acquire) > 0
            || self.shared.activation.work_pending()
    }

    // === stats surface ===

    pub fn stats(&self) -> SchedStats {
        let core = self.shared.core.lock();
        SchedStats {
            wsum: core.wsum,
            wsum_active: core.wsum_active,
            active_classes: core.active_classes,
            drops: self.shared.drops.load(Ordering::Relaxed),
        }
    }

    pub fn class_stats(&self, id: ClassId) -> Option<ClassStats> {
        let core = self.shared.core.lock();
        let cl = core.classes.get(&id)?;
        let counters = &cl.channel.counters;
        Some(ClassStats {
            packets: counters.packets.load(Ordering::Relaxed),
            bytes: counters.bytes.load(Ordering::Relaxed),
            drops: counters.drops.load(Ordering::Relaxed),
            rate_bps: cl.rate_bps,
            qlen: cl.channel.qlen(),
            weight: cl.weight() as u32,
            lmax: cl.lmax,
        })
    }

    /// Snapshot every class.
    pub fn walk(&self) -> Vec<(ClassId, ClassStats)> {
        let ids: Vec<ClassId> = {
            let core = self.shared.core.lock();
            core.classes.keys().copied().collect()
        };
        ids.into_iter()
            .filter_map(|id| self.class_stats(id).map(|st| (id, st)))
            .collect()
    }
}

/// Per-producer enqueue handle: classification, sub-queue append, and
/// activation publishing for one shard. Keeps a one-entry classifier memo
/// so a stream of packets to the same class skips the classifier, much
/// like caching the resolved class on the sending socket.
pub struct ProducerHandle {
    shared: Arc<Shared>,
    shard: usize,
    cache: Option<(u32, ClassId, Arc<ClassChannel>)>,
}

impl ProducerHandle {
    pub fn enqueue(&mut self, pkt: Packet) -> Result<(), EnqueueError> {
        let (id, channel) = match self.resolve(&pkt) {
            Ok(pair) => pair,
            Err(err) => {
                if matches!(
                    err,
                    EnqueueError::NoMatch | EnqueueError::Bypass | EnqueueError::Shot
                ) {
                    self.shared.drops.fetch_add(1, Ordering::Relaxed);
                }
                return Err(err);
            }
        };

        let len = pkt.len();
        let newly_backlogged = {
            let mut queue = channel.queue.lock();
            match queue.enqueue(pkt) {
                Ok(()) => queue.len() == 1,
                Err(_rejected) => {
                    drop(queue);
                    channel.counters.on_drop();
                    self.shared.drops.fetch_add(1, Ordering::Relaxed);
                    return Err(EnqueueError::Overlimit);
                }
            }
        };
        channel.counters.on_enqueue(len);

        if channel.is_zero_weight() {
            // also covers a deleted class behind a stale memo; drop the
            // memo so the next packet re-resolves
            self.cache = None;
        } else if newly_backlogged {
            self.shared.activation.publish(
                self.shard,
                ActivationEvent {
                    class_id: id,
                    pkt_len: len,
                },
            );
        }
        Ok(())
    }

    fn resolve(&mut self, pkt: &Packet) -> Result<(ClassId, Arc<ClassChannel>), EnqueueError> {
        if let Some((prio, id, channel)) = &self.cache {
            if *prio == pkt.priority {
                return Ok((*id, channel.clone()));
            }
        }

        match self.shared.classifier.classify(pkt) {
            Verdict::Class(id) => {
                let channel = self
                    .shared
                    .registry
                    .get(&id)
                    .map(|entry| entry.value().clone())
                    .ok_or(EnqueueError::NoMatch)?;
                self.cache = Some((pkt.priority, id, channel.clone()));
                Ok((id, channel))
            }
            Verdict::NoMatch => Err(EnqueueError::NoMatch),
            Verdict::Bypass => Err(EnqueueError::Bypass),
            Verdict::Stolen => Err(EnqueueError::Stolen),
            Verdict::Shot => Err(EnqueueError::Shot),
        }
    }
}
