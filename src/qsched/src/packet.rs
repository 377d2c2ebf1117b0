/// An owned packet buffer plus the metadata the scheduler cares about.
///
/// The scheduler never inspects the payload; it only needs the wire length
/// and the `priority` hint consumed by the classifier fast path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Classifier hint. The default classifier treats this as a class id.
    pub priority: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(priority: u32, payload: Vec<u8>) -> Self {
        Packet { priority, payload }
    }

    /// Wire length in bytes.
    pub fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
