use std::thread;
use std::time::{Duration, Instant};

use qsched::{ChannelSink, ClassParams, Packet, QfqSched, SchedConfig};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let sched = QfqSched::new(SchedConfig {
        // drop the pacing target so the demo saturates in a blink even on
        // a laptop
        link_speed: 1000,
        queue_limit: 10_000,
        spin_cpu: None,
        ..Default::default()
    });

    // three classes splitting the link 4:2:1
    let weights = [(1u32, 1000u32), (2, 500), (3, 250)];
    for (id, weight) in weights {
        sched.create_class(id, ClassParams::new(weight, 1500))?;
    }

    let (sink, rx) = ChannelSink::bounded(1024);
    let spinner = sched.spawn_spinner(Box::new(sink));

    const PER_PRODUCER: usize = 3000;
    let producers: Vec<_> = (0..2)
        .map(|p| {
            let mut handle = sched.handle();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let class = weights[(p + i) % weights.len()].0;
                    while handle.enqueue(Packet::new(class, vec![0; 1500])).is_err() {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    let started = Instant::now();
    let mut received = [0u64; 3];
    let mut bytes = 0u64;
    let total = 2 * PER_PRODUCER;
    for _ in 0..total {
        let pkt = rx.recv_timeout(Duration::from_secs(60))?;
        received[pkt.priority as usize - 1] += 1;
        bytes += pkt.len() as u64;
    }
    let elapsed = started.elapsed();

    for producer in producers {
        producer.join().expect("producer panicked");
    }

    println!(
        "drained {total} packets ({bytes} bytes) in {:.1} ms ({:.0} Mbit/s)",
        elapsed.as_secs_f64() * 1_000.0,
        bytes as f64 * 8.0 / elapsed.as_secs_f64() / 1e6,
    );
    for (id, _) in weights {
        let st = sched.class_stats(id).expect("class vanished");
        println!(
            "class {id}: weight {:4}  {:4} dequeued  rate ~{:.1} Mbit/s  drops {}",
            st.weight,
            received[id as usize - 1],
            st.rate_bps as f64 / 1e6,
            st.drops,
        );
    }
    let stats = sched.stats();
    println!(
        "scheduler: wsum {}  wsum_active {}  active classes {}  drops {}",
        stats.wsum, stats.wsum_active, stats.active_classes, stats.drops,
    );

    spinner.shutdown();
    Ok(())
}
