//! Queue and port counters.

use crate::socket::XdpStatistics;
use std::ops::AddAssign;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxStats {
    pub packets: u64,
    pub bytes: u64,
    /// Bursts that found descriptors but could not get application buffers for them.
    pub alloc_failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStats {
    pub packets: u64,
    pub bytes: u64,
    /// Frames handed to `tx_burst` and freed without being sent.
    pub dropped: u64,
}

/// Snapshot of one queue, or the sum over a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    /// Packets the kernel dropped on this socket since the last reset.
    pub rx_missed: u64,
    pub rx_alloc_failed: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_dropped: u64,
    /// Raw kernel counters, not reset.
    pub kernel: XdpStatistics,
}

impl QueueStats {
    pub(crate) fn new(rx: &RxStats, tx: &TxStats, kernel: XdpStatistics, missed_base: u64) -> Self {
        QueueStats {
            rx_packets: rx.packets,
            rx_bytes: rx.bytes,
            rx_missed: kernel.rx_dropped.saturating_sub(missed_base),
            rx_alloc_failed: rx.alloc_failed,
            tx_packets: tx.packets,
            tx_bytes: tx.bytes,
            tx_dropped: tx.dropped,
            kernel,
        }
    }
}

impl AddAssign<&QueueStats> for QueueStats {
    fn add_assign(&mut self, rhs: &QueueStats) {
        self.rx_packets += rhs.rx_packets;
        self.rx_bytes += rhs.rx_bytes;
        self.rx_missed += rhs.rx_missed;
        self.rx_alloc_failed += rhs.rx_alloc_failed;
        self.tx_packets += rhs.tx_packets;
        self.tx_bytes += rhs.tx_bytes;
        self.tx_dropped += rhs.tx_dropped;
        self.kernel.rx_dropped += rhs.kernel.rx_dropped;
        self.kernel.rx_invalid_descs += rhs.kernel.rx_invalid_descs;
        self.kernel.tx_invalid_descs += rhs.kernel.tx_invalid_descs;
        self.kernel.rx_ring_full += rhs.kernel.rx_ring_full;
        self.kernel.rx_fill_ring_empty_descs += rhs.kernel.rx_fill_ring_empty_descs;
        self.kernel.tx_ring_empty_descs += rhs.kernel.tx_ring_empty_descs;
    }
}
