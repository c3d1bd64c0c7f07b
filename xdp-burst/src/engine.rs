//! # Buffer Strategies
//!
//! ## Purpose
//!
//! A queue moves packets between the rings and application [`Mbuf`]s in one of two ways:
//!
//! - [`CopyEngine`]: the UMEM is private; payloads are copied into fresh mbufs on RX and out of
//!   mbufs on TX, and chunk addresses circulate through a free-address pool;
//! - [`ZeroCopyEngine`]: the UMEM is the mbuf pool itself; buffers go through the rings as they
//!   are and only their addresses are translated.
//!
//! The strategy is picked once when the queue is set up; the queue calls it through
//! [`RxTxEngine`] and keeps ring ownership, splitting and drop accounting to itself.

use crate::config::BufferMode;
use crate::mempool::{Mbuf, Mempool};
use crate::queue::{RxQueue, TxQueue};
use crate::ring::Ring;
use crate::umem::UmemRegion;
use crate::wakeup::WakeupPolicy;
use std::sync::Arc;

pub use crate::copy::CopyEngine;
pub use crate::zero_copy::ZeroCopyEngine;

pub trait RxTxEngine: Send {
    fn mode(&self) -> BufferMode;

    /// Puts up to `n` free buffers on the Fill ring; returns how many.
    fn stock_fill(&mut self, umem: &UmemRegion, fill: &mut Ring<u64>, n: u32) -> u32;

    /// Receives up to `n` packets into `out`; returns how many were appended.
    fn receive(
        &mut self,
        umem: &UmemRegion,
        rxq: &mut RxQueue,
        wakeup: &WakeupPolicy,
        out: &mut Vec<Mbuf>,
        n: u32,
    ) -> u32;

    /// Transmits frames from the front of `batch`; returns how many were submitted.
    ///
    /// Frames that were consumed but not submitted (oversized) are counted as dropped here.
    /// Frames left in `batch` were not attempted.
    fn transmit(&mut self, umem: &UmemRegion, txq: &mut TxQueue, batch: &mut Vec<Mbuf>) -> u32;

    /// Takes up to `n` addresses off the Completion ring and frees their buffers.
    fn reclaim(&mut self, umem: &UmemRegion, completion: &mut Ring<u64>, n: u32) -> u32;

    /// Called once when the queue closes. Buffers still with the kernel are handed to `umem`.
    ///
    /// Copy-mode chunks belong to the private region and need nothing here.
    fn close(&mut self, _umem: &UmemRegion) {}
}

/// Builds the engine for `umem`. `rx_pool` supplies the mbufs copy mode receives into.
pub(crate) fn build(umem: &UmemRegion, rx_pool: &Arc<Mempool>) -> Box<dyn RxTxEngine> {
    match umem.pool() {
        Some(pool) => Box::new(ZeroCopyEngine::new(pool.clone())),
        None => Box::new(CopyEngine::new(umem, rx_pool.clone())),
    }
}
