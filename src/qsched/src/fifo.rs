use std::collections::VecDeque;

use crate::packet::Packet;

/// The contract a per-class sub-queue has to satisfy.
///
/// The scheduler treats the sub-queue as opaque: it appends on enqueue,
/// peeks the head length to compute finish timestamps, pops the head it
/// just peeked, and can reclaim buffers one packet at a time. The queueing
/// policy behind this interface (tail-drop, RED, whatever) is not its
/// business.
pub trait SubQueue: Send {
    /// Append a packet. On rejection the packet is handed back so the
    /// caller can account the drop.
    fn enqueue(&mut self, pkt: Packet) -> Result<(), Packet>;

    /// Length in bytes of the head packet, 0 if the queue is empty.
    fn peek_len(&self) -> u32;

    /// Pop the head packet previously observed via `peek_len`.
    fn dequeue_peeked(&mut self) -> Option<Packet>;

    /// Drop one packet (from the tail), returning the bytes reclaimed,
    /// 0 if the queue was empty.
    fn drop_one(&mut self) -> u32;

    /// Number of queued packets.
    fn len(&self) -> u32;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard everything.
    fn reset(&mut self);
}

/// Bounded FIFO that rejects new packets once full.
pub struct TailDropFifo {
    limit: usize,
    queue: VecDeque<Packet>,
}

impl TailDropFifo {
    pub fn new(limit: usize) -> Self {
        TailDropFifo {
            limit,
            queue: VecDeque::new(),
        }
    }
}

impl SubQueue for TailDropFifo {
    fn enqueue(&mut self, pkt: Packet) -> Result<(), Packet> {
        if self.queue.len() >= self.limit {
            return Err(pkt);
        }
        self.queue.push_back(pkt);
        Ok(())
    }

    fn peek_len(&self) -> u32 {
        self.queue.front().map_or(0, Packet::len)
    }

    fn dequeue_peeked(&mut self) -> Option<Packet> {
        self.queue.pop_front()
    }

    fn drop_one(&mut self) -> u32 {
        self.queue.pop_back().map_or(0, |pkt| pkt.len())
    }

    fn len(&self) -> u32 {
        self.queue.len() as u32
    }

    fn reset(&mut self) {
        self.queue.clear();
    }
}
