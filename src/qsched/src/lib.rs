#[macro_use]
extern crate tracing;

pub mod classify;
pub mod fifo;
pub mod packet;
pub mod qfq;
pub mod stats;
pub mod transmit;

pub use classify::{Classifier, PriorityClassifier, Verdict};
pub use fifo::{SubQueue, TailDropFifo};
pub use packet::Packet;
pub use qfq::{
    ClassId, ClassParams, Clock, ConfigError, EnqueueError, ManualClock, MonotonicClock,
    ProducerHandle, QfqSched, SchedConfig, Spinner,
};
pub use stats::{ClassStats, SchedStats};
pub use transmit::{ChannelSink, NullSink, TxSink, TxStatus};
