use crate::packet::Packet;
use crate::qfq::ClassId;

/// Outcome of classifying a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Packet belongs to this class.
    Class(ClassId),
    /// No filter matched.
    NoMatch,
    /// A filter told us to skip this scheduler entirely.
    Bypass,
    /// A filter consumed the packet; not an error, but nothing to enqueue.
    Stolen,
    /// A filter decided the packet must be discarded.
    Shot,
}

/// Maps packets to traffic classes. Implementations must be cheap: this
/// runs on the producer hot path for every enqueued packet.
pub trait Classifier: Send + Sync {
    fn classify(&self, pkt: &Packet) -> Verdict;
}

/// Classifier that reads the class id straight out of the packet priority
/// field. Priority 0 means "unclassified".
pub struct PriorityClassifier;

impl Classifier for PriorityClassifier {
    fn classify(&self, pkt: &Packet) -> Verdict {
        if pkt.priority == 0 {
            Verdict::NoMatch
        } else {
            Verdict::Class(pkt.priority)
        }
    }
}
