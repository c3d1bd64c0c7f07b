//! # Ports
//!
//! An [`XskPort`] manages the queue pairs opened on one interface: it owns the factory and a
//! handle to the UMEM registry, sets queues up by index, and sums their counters. Queues can
//! be taken out with [`XskPort::into_queues`] to be driven from worker threads.

use crate::config::{MAX_QUEUE_PAIRS, XskConfig};
use crate::create::{QueueFactory, XdpQueueFactory};
use crate::mempool::Mempool;
use crate::queue::{QueueSetup, XskQueue};
use crate::registry::{QueueKey, UmemRegistry};
use crate::stats::QueueStats;
use crate::umem::XDP_PACKET_HEADROOM;
use std::io;
use std::sync::Arc;

/// Smallest MTU accepted on Ethernet.
pub const MIN_MTU: u32 = 68;
/// Largest frame received without jumbo support (`ETH_FRAME_LEN`).
pub const MAX_RX_PKTLEN: u32 = 1514;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortInfo {
    pub if_index: u32,
    pub min_mtu: u32,
    /// Largest packet the UMEM of the first open queue carries. With no queue open it is the
    /// copy-mode chunk figure from the port config.
    pub max_mtu: u32,
    pub max_rx_pktlen: u32,
    pub max_queue_pairs: u32,
    pub default_ring_size: u32,
}

pub struct XskPort {
    if_index: u32,
    config: XskConfig,
    factory: Box<dyn QueueFactory>,
    registry: Arc<UmemRegistry>,
    queues: Vec<Option<XskQueue>>,
}

impl std::fmt::Debug for XskPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XskPort")
            .field("if_index", &self.if_index)
            .field("config", &self.config)
            .field("queues", &self.queues)
            .finish()
    }
}

impl XskPort {
    /// A port on interface `if_index` backed by real AF_XDP sockets.
    pub fn new(if_index: u32, config: XskConfig) -> io::Result<Self> {
        Self::with_factory(
            if_index,
            config,
            Box::new(XdpQueueFactory),
            UmemRegistry::new(),
        )
    }

    /// A port using `factory` for its sockets. Ports given the same `registry` can share
    /// UMEM regions.
    pub fn with_factory(
        if_index: u32,
        config: XskConfig,
        factory: Box<dyn QueueFactory>,
        registry: Arc<UmemRegistry>,
    ) -> io::Result<Self> {
        config.validate()?;
        Ok(XskPort {
            if_index,
            config,
            factory,
            registry,
            queues: (0..MAX_QUEUE_PAIRS).map(|_| None).collect(),
        })
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    pub fn registry(&self) -> &Arc<UmemRegistry> {
        &self.registry
    }

    /// Opens queue pair `queue_index`, closing it first if it was open.
    pub fn setup_queue(
        &mut self,
        queue_index: u32,
        pool: &Arc<Mempool>,
    ) -> io::Result<&mut XskQueue> {
        let slot = self
            .queues
            .get_mut(queue_index as usize)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("queue {queue_index} exceeds the {MAX_QUEUE_PAIRS} queue pairs"),
                )
            })?;
        if slot.take().is_some() {
            log::debug!("if{}/q{queue_index}: replacing open queue", self.if_index);
        }
        let queue = XskQueue::setup(QueueSetup {
            factory: self.factory.as_ref(),
            registry: &self.registry,
            pool,
            key: QueueKey::new(self.if_index, queue_index),
            config: self.config,
        })?;
        Ok(slot.insert(queue))
    }

    pub fn queue_mut(&mut self, queue_index: u32) -> Option<&mut XskQueue> {
        self.queues.get_mut(queue_index as usize)?.as_mut()
    }

    /// Closes queue pair `queue_index`, returning it to the caller to drop or keep.
    pub fn release_queue(&mut self, queue_index: u32) -> Option<XskQueue> {
        self.queues.get_mut(queue_index as usize)?.take()
    }

    pub fn open_queues(&self) -> impl Iterator<Item = &XskQueue> {
        self.queues.iter().flatten()
    }

    /// Counters summed over all open queues.
    pub fn stats(&self) -> io::Result<QueueStats> {
        let mut total = QueueStats::default();
        for queue in self.open_queues() {
            total += &queue.stats()?;
        }
        Ok(total)
    }

    pub fn reset_stats(&mut self) -> io::Result<()> {
        for queue in self.queues.iter_mut().flatten() {
            queue.reset_stats()?;
        }
        Ok(())
    }

    pub fn info(&self) -> PortInfo {
        PortInfo {
            if_index: self.if_index,
            min_mtu: MIN_MTU,
            max_mtu: self.open_queues().next().map_or(
                self.config.frame_size() - self.config.frame_headroom() - XDP_PACKET_HEADROOM,
                |queue| queue.umem().data_room(),
            ),
            max_rx_pktlen: MAX_RX_PKTLEN,
            max_queue_pairs: MAX_QUEUE_PAIRS,
            default_ring_size: self.config.ring_size(),
        }
    }

    /// Takes all open queues out of the port.
    pub fn into_queues(self) -> Vec<XskQueue> {
        self.queues.into_iter().flatten().collect()
    }
}
