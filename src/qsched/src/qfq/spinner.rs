//! The dedicated consumer: a pinned, busy-spinning worker thread that
//! owns the dequeue side of the scheduler and feeds the transmit path.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bitflags::bitflags;

use crate::packet::Packet;
use crate::transmit::{TxSink, TxStatus};

use super::QfqSched;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct SpinnerSignal: u32 {
        const STOP = 1 << 0;
    }
}

/// How many idle-wait iterations between voluntary yields.
const WAIT_YIELD_EVERY: u32 = 10_000;
/// How many work-loop iterations between voluntary yields; even a busy
/// spinner has to give the OS a slice now and then.
const LOOP_YIELD_EVERY: u32 = 100_000;

struct Ctl {
    signals: AtomicU32,
}

impl Ctl {
    fn assert(&self, sig: SpinnerSignal) {
        self.signals.fetch_or(sig.bits(), Ordering::Release);
    }

    fn stop_requested(&self) -> bool {
        SpinnerSignal::from_bits_retain(self.signals.load(Ordering::Acquire))
            .contains(SpinnerSignal::STOP)
    }
}

/// Handle to the running consumer thread.
pub struct Spinner {
    ctl: Arc<Ctl>,
    join: JoinHandle<()>,
    sched: QfqSched,
}

impl Spinner {
    /// Spawn the consumer. There must be at most one per scheduler: the
    /// whole point of the design is a single mutator of dequeue state.
    pub(super) fn spawn(
        sched: QfqSched,
        tx: Box<dyn TxSink>,
        spin_cpu: Option<usize>,
    ) -> Spinner {
        let ctl = Arc::new(Ctl {
            signals: AtomicU32::new(0),
        });

        let worker = Worker {
            sched: sched.clone(),
            ctl: ctl.clone(),
            tx,
            pending: None,
        };

        let join = thread::Builder::new()
            .name("qfq-spinner".to_string())
            .spawn(move || worker.work(spin_cpu))
            .expect("failed to spawn thread");

        Spinner { ctl, join, sched }
    }

    /// Stop the consumer, wait for it to exit, then drain whatever is
    /// still queued so nothing outlives the scheduler.
    pub fn shutdown(self) {
        self.ctl.assert(SpinnerSignal::STOP);
        if self.join.join().is_err() {
            error!("spinner thread panicked");
        }
        self.sched.reset();
    }
}

struct Worker {
    sched: QfqSched,
    ctl: Arc<Ctl>,
    tx: Box<dyn TxSink>,
    /// Packet dequeued but not yet accepted by the transmit path.
    pending: Option<Packet>,
}

impl Worker {
    fn work(mut self, spin_cpu: Option<usize>) {
        if let Some(cpu) = spin_cpu {
            pin_and_elevate(cpu);
        }
        info!(cpu = spin_cpu, "spinner running");

        let mut loops: u32 = 0;
        loop {
            if self.ctl.stop_requested() {
                break;
            }

            if self.pending.is_none() {
                self.wait_for_work();
            }

            self.sched.drain_activations();

            if self.pending.is_none() {
                self.pending = self.sched.dequeue();
            }

            if let Some(pkt) = self.pending.take() {
                if self.tx.is_frozen_or_stopped() {
                    self.pending = Some(pkt);
                } else {
                    match self.tx.transmit(pkt) {
                        TxStatus::Sent => {}
                        TxStatus::Busy(pkt) | TxStatus::Error(pkt) => {
                            self.pending = Some(pkt);
                        }
                    }
                }
            }

            loops += 1;
            if loops >= LOOP_YIELD_EVERY {
                loops = 0;
                thread::yield_now();
            }
        }

        info!("spinner stopped");
    }

    /// Busy-wait until a class is slotted, an activation is pending, or
    /// stop is requested.
    fn wait_for_work(&self) {
        let mut counter: u32 = 0;
        while !self.sched.has_work() && !self.ctl.stop_requested() {
            counter += 1;
            if counter >= WAIT_YIELD_EVERY {
                counter = 0;
                thread::yield_now();
            }
            std::hint::spin_loop();
        }
    }
}

#[cfg(target_os = "linux")]
fn pin_and_elevate(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!(
                cpu,
                "failed to pin spinner: {}",
                std::io::Error::last_os_error()
            );
        }

        let param = libc::sched_param {
            sched_priority: libc::sched_get_priority_max(libc::SCHED_FIFO),
        };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            // needs CAP_SYS_NICE; fine to run without it
            debug!(
                "could not raise spinner to SCHED_FIFO: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_and_elevate(cpu: usize) {
    warn!(cpu, "spinner pinning is not supported on this platform");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::transmit::ChannelSink;
    use crate::{ClassParams, Packet, QfqSched, SchedConfig};

    #[test]
    fn spinner_drains_enqueued_packets() {
        let sched = QfqSched::new(SchedConfig {
            spin_cpu: None,
            ..Default::default()
        });
        // weight above the link speed so the class drains at line rate
        sched
            .create_class(1, ClassParams::new(16384, 1500))
            .unwrap();

        let (sink, rx) = ChannelSink::bounded(64);
        let spinner = sched.spawn_spinner(Box::new(sink));

        let mut handle = sched.handle();
        for seq in 0..50u8 {
            let mut payload = vec![0u8; 300];
            payload[0] = seq;
            handle.enqueue(Packet::new(1, payload)).unwrap();
        }

        let mut got = Vec::new();
        while got.len() < 50 {
            match rx.recv_timeout(Duration::from_secs(5)) {
                Ok(pkt) => got.push(pkt.payload[0]),
                Err(err) => panic!("spinner stalled: {err} (got {})", got.len()),
            }
        }
        let expect: Vec<u8> = (0..50).collect();
        assert_eq!(got, expect);

        spinner.shutdown();
        assert_eq!(sched.stats().active_classes, 0);
        assert_eq!(sched.class_stats(1).unwrap().qlen, 0);
    }

    #[test]
    fn shutdown_purges_backlog() {
        let sched = QfqSched::new(SchedConfig {
            spin_cpu: None,
            ..Default::default()
        });
        sched.create_class(1, ClassParams::new(0, 1500)).unwrap();

        let (sink, _rx) = ChannelSink::bounded(64);
        let spinner = sched.spawn_spinner(Box::new(sink));

        let mut handle = sched.handle();
        for _ in 0..10 {
            handle.enqueue(Packet::new(1, vec![0; 100])).unwrap();
        }
        assert_eq!(sched.class_stats(1).unwrap().qlen, 10);

        spinner.shutdown();
        assert_eq!(sched.class_stats(1).unwrap().qlen, 0);
    }
}
