use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::packet::Packet;

/// Result of handing a packet to the transmit path.
#[derive(Debug)]
pub enum TxStatus {
    Sent,
    /// The queue is congested; the packet is handed back and the caller
    /// must retry it before dequeueing anything else.
    Busy(Packet),
    /// The device rejected the packet. The caller keeps it and retries;
    /// persistent errors surface through the device's own diagnostics.
    Error(Packet),
}

/// The device transmit contract.
pub trait TxSink: Send {
    /// True while the transmit queue cannot accept packets at all.
    fn is_frozen_or_stopped(&self) -> bool;

    fn transmit(&mut self, pkt: Packet) -> TxStatus;
}

/// Transmit sink backed by a bounded channel. A full channel reports Busy,
/// which exercises the caller's retained-packet retry path.
pub struct ChannelSink {
    tx: Sender<Packet>,
}

impl ChannelSink {
    pub fn bounded(cap: usize) -> (Self, Receiver<Packet>) {
        let (tx, rx) = crossbeam_channel::bounded(cap);
        (ChannelSink { tx }, rx)
    }
}

impl TxSink for ChannelSink {
    fn is_frozen_or_stopped(&self) -> bool {
        self.tx.is_full()
    }

    fn transmit(&mut self, pkt: Packet) -> TxStatus {
        match self.tx.try_send(pkt) {
            Ok(()) => TxStatus::Sent,
            Err(TrySendError::Full(pkt)) => TxStatus::Busy(pkt),
            Err(TrySendError::Disconnected(pkt)) => TxStatus::Error(pkt),
        }
    }
}

/// Sink that accepts and discards everything. Useful for benchmarks.
pub struct NullSink;

impl TxSink for NullSink {
    fn is_frozen_or_stopped(&self) -> bool {
        false
    }

    fn transmit(&mut self, _pkt: Packet) -> TxStatus {
        TxStatus::Sent
    }
}
