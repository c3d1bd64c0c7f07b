//! # Copy-Mode Engine
//!
//! ## How it works
//!
//! RX: when at least half of the Fill ring is free it is topped up from the address pool
//! (never above half full, never more than the burst size), then RX is peeked. Mbufs for all
//! peeked descriptors are allocated in one go; if that fails the peek is cancelled and the
//! descriptors stay for the next call. Payloads are copied and the chunks go back to the pool.
//!
//! TX: completions are drained, as many chunks as are free (up to the burst) are taken, TX
//! slots are reserved for all of them (kick and one retry on failure), payloads are copied in,
//! the mbufs are freed and the descriptors submitted.

use crate::addr_pool::AddrPool;
use crate::config::BufferMode;
use crate::engine::RxTxEngine;
use crate::mempool::{Mbuf, Mempool};
use crate::queue::{RxQueue, TxQueue};
use crate::ring::{Ring, XdpDesc};
use crate::umem::UmemRegion;
use crate::wakeup::WakeupPolicy;
use std::sync::Arc;

#[derive(Debug)]
pub struct CopyEngine {
    addrs: AddrPool,
    pool: Arc<Mempool>,
    chunks: Vec<u64>,
    bufs: Vec<Mbuf>,
}

impl CopyEngine {
    pub fn new(umem: &UmemRegion, pool: Arc<Mempool>) -> Self {
        CopyEngine {
            addrs: AddrPool::new(umem.chunk_size(), umem.chunk_count(), umem.frame_headroom()),
            pool,
            chunks: Vec::new(),
            bufs: Vec::new(),
        }
    }

    /// Chunks neither on a ring nor in flight.
    pub fn free_chunks(&self) -> usize {
        self.addrs.available()
    }

    fn refill(&mut self, fill: &mut Ring<u64>, n: u32) -> u32 {
        let count = n.min(self.addrs.available() as u32);
        if count < n {
            log::debug!("only {count} of {n} chunks free for the Fill ring");
        }
        if count == 0 {
            return 0;
        }
        self.chunks.clear();
        self.addrs.acquire(count as usize, &mut self.chunks);
        let Ok(idx) = fill.reserve(count) else {
            log::debug!("Fill ring has no room for {count} chunks");
            self.addrs.release_all(self.chunks.drain(..));
            return 0;
        };
        for (i, &addr) in self.chunks.iter().enumerate() {
            fill.write(idx.wrapping_add(i as u32), addr);
        }
        fill.submit(count);
        count
    }
}

fn pull_completions(addrs: &mut AddrPool, umem: &UmemRegion, cq: &mut Ring<u64>, n: u32) -> u32 {
    let (count, idx) = cq.peek(n);
    for i in 0..count {
        let addr = cq.read(idx.wrapping_add(i));
        if addr < umem.len() as u64 {
            addrs.release(addr);
        } else {
            log::error!("completion address {addr:#x} is outside the UMEM");
        }
    }
    cq.release(count);
    count
}

impl RxTxEngine for CopyEngine {
    fn mode(&self) -> BufferMode {
        BufferMode::Copy
    }

    fn stock_fill(&mut self, _umem: &UmemRegion, fill: &mut Ring<u64>, n: u32) -> u32 {
        self.refill(fill, n)
    }

    fn receive(
        &mut self,
        umem: &UmemRegion,
        rxq: &mut RxQueue,
        wakeup: &WakeupPolicy,
        out: &mut Vec<Mbuf>,
        n: u32,
    ) -> u32 {
        let watermark = rxq.fill.capacity() / 2;
        let free = rxq.fill.free_slots(rxq.fill.capacity());
        if free >= watermark {
            let stocked = rxq.fill.capacity() - free;
            self.refill(&mut rxq.fill, watermark.saturating_sub(stocked).min(n));
        }

        let (rcvd, idx) = rxq.ring.peek(n);
        if rcvd == 0 {
            wakeup.rx_idle(&rxq.fill);
            return 0;
        }

        self.bufs.clear();
        if !self.pool.alloc_bulk(rcvd as usize, &mut self.bufs) {
            log::debug!("no mbufs for {rcvd} received packets, retrying later");
            rxq.ring.cancel_peek(rcvd);
            rxq.stats.alloc_failed += rcvd as u64;
            return 0;
        }

        let mut delivered = 0;
        for (i, mut mbuf) in self.bufs.drain(..).enumerate() {
            let desc = rxq.ring.read(idx.wrapping_add(i as u32));
            // SAFETY: the chunk came off the RX ring, the queue owns it until released below.
            let data = unsafe { umem.bytes(desc.addr, desc.len as usize) };
            match data {
                Some(data) if mbuf.fill_from(data) => {
                    rxq.stats.bytes += desc.len as u64;
                    out.push(mbuf);
                    delivered += 1;
                }
                Some(_) => log::error!("RX descriptor {desc:?} does not fit an mbuf"),
                None => {
                    log::error!("RX descriptor {desc:?} is outside the UMEM");
                    continue;
                }
            }
            self.addrs.release(desc.addr);
        }
        rxq.ring.release(rcvd);
        rxq.stats.packets += delivered as u64;
        delivered
    }

    fn transmit(&mut self, umem: &UmemRegion, txq: &mut TxQueue, batch: &mut Vec<Mbuf>) -> u32 {
        let n = batch.len() as u32;
        pull_completions(&mut self.addrs, umem, &mut txq.completion, n);

        let count = n.min(self.addrs.available() as u32);
        if count == 0 {
            return 0;
        }
        self.chunks.clear();
        self.addrs.acquire(count as usize, &mut self.chunks);

        let idx = match txq.ring.reserve(count) {
            Ok(idx) => idx,
            Err(_) => {
                let addrs = &mut self.addrs;
                let completion = &mut txq.completion;
                txq.kick.kick(&txq.ring, || {
                    pull_completions(addrs, umem, completion, n);
                });
                match txq.ring.reserve(count) {
                    Ok(idx) => idx,
                    Err(e) => {
                        log::debug!("TX: {e}, {count} frames not sent");
                        self.addrs.release_all(self.chunks.drain(..));
                        return 0;
                    }
                }
            }
        };

        let room = (umem.chunk_size() - umem.frame_headroom()) as usize;
        let mut written = 0u32;
        for mbuf in batch.drain(..count as usize) {
            let len = mbuf.len();
            let addr = self.chunks[written as usize];
            if len > room {
                log::debug!("TX: dropping {len} byte frame, chunk holds {room}");
                txq.stats.dropped += 1;
                continue;
            }
            // SAFETY: the chunk was taken from the free pool and is not on any ring yet.
            let Some(dst) = (unsafe { umem.bytes_mut(addr, len) }) else {
                log::error!("TX chunk {addr:#x} is outside the UMEM");
                txq.stats.dropped += 1;
                continue;
            };
            dst.copy_from_slice(mbuf.data());
            txq.ring.write(idx.wrapping_add(written), XdpDesc::new(addr, len as u32, 0));
            txq.stats.bytes += len as u64;
            written += 1;
        }

        let unused = count - written;
        if unused > 0 {
            txq.ring.cancel_reserve(unused);
            self.addrs.release_all(self.chunks.drain(written as usize..));
        }
        txq.ring.submit(written);
        txq.stats.packets += written as u64;

        let addrs = &mut self.addrs;
        let completion = &mut txq.completion;
        txq.kick.kick(&txq.ring, || {
            pull_completions(addrs, umem, completion, n);
        });
        written
    }

    fn reclaim(&mut self, umem: &UmemRegion, completion: &mut Ring<u64>, n: u32) -> u32 {
        pull_completions(&mut self.addrs, umem, completion, n)
    }
}
