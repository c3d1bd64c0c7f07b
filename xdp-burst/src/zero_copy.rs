//! # Zero-Copy Engine
//!
//! The mbuf pool is the UMEM. A buffer's UMEM address is its element offset from the pool
//! base; descriptors carry that base plus the offset of the packet data within the element
//! (see [`UmemAddress`]).
//!
//! RX allocates replacement buffers before touching the descriptors, turns every descriptor
//! back into the mbuf it names, and gives the replacements to the Fill ring. TX hands pool
//! buffers to the kernel as they are; frames from other pools are copied into a pool buffer
//! first. Buffers come back through the Completion ring.
//!
//! Every element given to the kernel is recorded in a [`HeldSet`] until it comes back. A
//! descriptor naming an element that is not recorded is rejected, and whatever is still
//! recorded when the queue closes is parked on the UMEM region, which returns it to the pool
//! once the last socket using the region is gone.

use crate::addr::UmemAddress;
use crate::config::BufferMode;
use crate::engine::RxTxEngine;
use crate::mempool::{Mbuf, Mempool};
use crate::queue::{RxQueue, TxQueue};
use crate::ring::{Ring, XdpDesc};
use crate::umem::UmemRegion;
use crate::wakeup::WakeupPolicy;
use std::sync::Arc;

/// Pool elements currently owned by the kernel, one bit per element.
#[derive(Debug, Default)]
pub struct HeldSet {
    bits: Vec<u64>,
    len: usize,
}

impl HeldSet {
    pub fn new(capacity: u32) -> Self {
        HeldSet {
            bits: vec![0; (capacity as usize).div_ceil(64)],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, index: u32) -> bool {
        let (word, bit) = Self::position(index);
        self.bits.get(word).is_some_and(|w| w & bit != 0)
    }

    /// Records `index`; false if it was already recorded.
    pub fn insert(&mut self, index: u32) -> bool {
        let (word, bit) = Self::position(index);
        match self.bits.get_mut(word) {
            Some(w) if *w & bit == 0 => {
                *w |= bit;
                self.len += 1;
                true
            }
            _ => false,
        }
    }

    /// Forgets `index`; false if it was not recorded.
    pub fn remove(&mut self, index: u32) -> bool {
        let (word, bit) = Self::position(index);
        match self.bits.get_mut(word) {
            Some(w) if *w & bit != 0 => {
                *w &= !bit;
                self.len -= 1;
                true
            }
            _ => false,
        }
    }

    /// Empties the set, returning the recorded indices.
    pub fn take_all(&mut self) -> Vec<u32> {
        let mut indices = Vec::with_capacity(self.len);
        for (word, bits) in self.bits.iter_mut().enumerate() {
            let mut w = std::mem::take(bits);
            while w != 0 {
                indices.push(word as u32 * 64 + w.trailing_zeros());
                w &= w - 1;
            }
        }
        self.len = 0;
        indices
    }

    #[inline]
    fn position(index: u32) -> (usize, u64) {
        ((index / 64) as usize, 1 << (index % 64))
    }
}

#[derive(Debug)]
pub struct ZeroCopyEngine {
    pool: Arc<Mempool>,
    bufs: Vec<Mbuf>,
    held: HeldSet,
}

impl ZeroCopyEngine {
    pub fn new(pool: Arc<Mempool>) -> Self {
        ZeroCopyEngine {
            held: HeldSet::new(pool.capacity()),
            pool,
            bufs: Vec::new(),
        }
    }

    /// Elements currently given to the kernel by this queue.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Descriptor address of the packet data of `mbuf`.
    fn encode(&self, mbuf: &Mbuf) -> u64 {
        let base = self.pool.element_offset(mbuf.index());
        let offset = (self.pool.buffer_offset() + mbuf.headroom() as usize) as u32;
        UmemAddress::new(base, offset).to_wire()
    }

    /// Recovers the mbuf a received descriptor points at.
    fn decode(&mut self, desc: &XdpDesc) -> Option<Mbuf> {
        let addr = UmemAddress::from_wire(desc.addr);
        let index = self.pool.element_index(addr.base)?;
        if !self.held.remove(index) {
            log::error!("RX descriptor {desc:?} names buffer {index} the kernel does not own");
            return None;
        }
        // SAFETY: the element was given to the kernel through the Fill ring and has just been
        // returned on the RX ring; the held set guarantees it is rebuilt only once.
        let mut mbuf = unsafe { self.pool.from_raw(index) };
        let data_off = addr
            .offset
            .checked_sub(self.pool.buffer_offset() as u32)
            .and_then(|off| u16::try_from(off).ok())?;
        mbuf.set_data(data_off, desc.len).then_some(mbuf)
    }
}

/// Gives the buffers in `bufs` to the Fill ring, or back to the pool if it has no room.
fn push_fill(
    pool: &Mempool,
    held: &mut HeldSet,
    fill: &mut Ring<u64>,
    bufs: &mut Vec<Mbuf>,
) -> u32 {
    let n = bufs.len() as u32;
    if n == 0 {
        return 0;
    }
    let Ok(idx) = fill.reserve(n) else {
        log::debug!("Fill ring has no room for {n} buffers");
        pool.free_bulk(bufs);
        return 0;
    };
    for (i, mbuf) in bufs.drain(..).enumerate() {
        fill.write(idx.wrapping_add(i as u32), pool.element_offset(mbuf.index()));
        held.insert(mbuf.into_raw());
    }
    fill.submit(n);
    n
}

fn pull_completions(pool: &Mempool, held: &mut HeldSet, cq: &mut Ring<u64>, n: u32) -> u32 {
    let (count, idx) = cq.peek(n);
    for i in 0..count {
        let raw = cq.read(idx.wrapping_add(i));
        match pool.element_index(UmemAddress::from_wire(raw).base) {
            // SAFETY: the held set hands each transmitted element back exactly once.
            Some(index) if held.remove(index) => unsafe { pool.free_raw(index) },
            _ => log::error!("completion address {raw:#x} is not a buffer of {}", pool.name()),
        }
    }
    cq.release(count);
    count
}

/// Reserves one TX slot, kicking the kernel and retrying once if the ring is full.
fn reserve_slot(pool: &Mempool, held: &mut HeldSet, txq: &mut TxQueue) -> Option<u32> {
    if let Ok(idx) = txq.ring.reserve(1) {
        return Some(idx);
    }
    let completion = &mut txq.completion;
    let budget = completion.capacity();
    txq.kick.kick(&txq.ring, || {
        pull_completions(pool, held, completion, budget);
    });
    txq.ring.reserve(1).ok()
}

impl RxTxEngine for ZeroCopyEngine {
    fn mode(&self) -> BufferMode {
        BufferMode::ZeroCopy
    }

    fn stock_fill(&mut self, _umem: &UmemRegion, fill: &mut Ring<u64>, n: u32) -> u32 {
        self.bufs.clear();
        if !self.pool.alloc_bulk(n as usize, &mut self.bufs) {
            log::debug!(
                "mempool {}: {} buffers free, cannot stock {n} Fill entries",
                self.pool.name(),
                self.pool.available()
            );
            return 0;
        }
        push_fill(&self.pool, &mut self.held, fill, &mut self.bufs)
    }

    fn receive(
        &mut self,
        _umem: &UmemRegion,
        rxq: &mut RxQueue,
        wakeup: &WakeupPolicy,
        out: &mut Vec<Mbuf>,
        n: u32,
    ) -> u32 {
        let (rcvd, idx) = rxq.ring.peek(n);
        if rcvd == 0 {
            wakeup.rx_idle(&rxq.fill);
            return 0;
        }

        let mut replacements = std::mem::take(&mut self.bufs);
        replacements.clear();
        if !self.pool.alloc_bulk(rcvd as usize, &mut replacements) {
            log::debug!("no replacement buffers for {rcvd} received packets, retrying later");
            self.bufs = replacements;
            rxq.ring.cancel_peek(rcvd);
            rxq.stats.alloc_failed += rcvd as u64;
            return 0;
        }

        let mut delivered = 0;
        for i in 0..rcvd {
            let desc = rxq.ring.read(idx.wrapping_add(i));
            match self.decode(&desc) {
                Some(mbuf) => {
                    rxq.stats.bytes += desc.len as u64;
                    out.push(mbuf);
                    delivered += 1;
                }
                None => log::error!("RX descriptor {desc:?} does not name a buffer"),
            }
        }
        rxq.ring.release(rcvd);
        rxq.stats.packets += delivered as u64;

        push_fill(&self.pool, &mut self.held, &mut rxq.fill, &mut replacements);
        self.bufs = replacements;
        delivered
    }

    fn transmit(&mut self, _umem: &UmemRegion, txq: &mut TxQueue, batch: &mut Vec<Mbuf>) -> u32 {
        let capacity = txq.completion.capacity();
        if txq.completion.occupancy() >= capacity / 2 {
            pull_completions(&self.pool, &mut self.held, &mut txq.completion, capacity);
        }

        let mut sent = 0u32;
        let mut frames = std::mem::take(batch).into_iter();
        while let Some(mbuf) = frames.next() {
            let (frame, original) = if mbuf.pool_id() == self.pool.id() {
                (mbuf, None)
            } else {
                let Some(mut local) = self.pool.alloc() else {
                    log::debug!("mempool {}: no buffer to copy a frame into", self.pool.name());
                    batch.push(mbuf);
                    break;
                };
                if !local.fill_from(mbuf.data()) {
                    log::debug!("TX: dropping {} byte frame, buffer too small", mbuf.len());
                    txq.stats.dropped += 1;
                    continue;
                }
                (local, Some(mbuf))
            };

            let Some(idx) = reserve_slot(&self.pool, &mut self.held, txq) else {
                log::debug!("TX ring full");
                batch.push(original.unwrap_or(frame));
                break;
            };
            let len = frame.len() as u32;
            txq.ring.write(idx, XdpDesc::new(self.encode(&frame), len, 0));
            self.held.insert(frame.into_raw());
            txq.stats.bytes += len as u64;
            sent += 1;
        }
        batch.extend(frames);

        txq.ring.submit(sent);
        txq.stats.packets += sent as u64;

        let pool = &self.pool;
        let held = &mut self.held;
        let completion = &mut txq.completion;
        txq.kick.kick(&txq.ring, || {
            pull_completions(pool, held, completion, capacity);
        });
        sent
    }

    fn reclaim(&mut self, _umem: &UmemRegion, completion: &mut Ring<u64>, n: u32) -> u32 {
        pull_completions(&self.pool, &mut self.held, completion, n)
    }

    fn close(&mut self, umem: &UmemRegion) {
        let held = self.held.take_all();
        if !held.is_empty() {
            log::debug!(
                "mempool {}: {} buffers still with the kernel, returned when the UMEM is released",
                self.pool.name(),
                held.len()
            );
            umem.park(held);
        }
    }
}
