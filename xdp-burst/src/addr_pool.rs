//! Free chunk addresses of a copy-mode UMEM.
//!
//! Every chunk of the region is always in exactly one place: this pool, the Fill ring, the RX
//! ring, the TX ring or the Completion ring. The pool is the only one of those the queue owns
//! outright, so it is a plain FIFO.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct AddrPool {
    free: VecDeque<u64>,
    chunk_mask: u64,
    headroom: u64,
    capacity: usize,
}

impl AddrPool {
    /// A pool holding every chunk of a region of `chunk_count` chunks of `chunk_size` bytes,
    /// each address pointing `headroom` bytes into its chunk.
    pub fn new(chunk_size: u32, chunk_count: u32, headroom: u32) -> Self {
        debug_assert!(chunk_size.is_power_of_two());
        let free = (0..chunk_count as u64)
            .map(|i| i * chunk_size as u64 + headroom as u64)
            .collect::<VecDeque<_>>();
        AddrPool {
            capacity: free.len(),
            free,
            chunk_mask: !(chunk_size as u64 - 1),
            headroom: headroom as u64,
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Moves exactly `n` addresses to `out`, or none if fewer are free.
    pub fn acquire(&mut self, n: usize, out: &mut Vec<u64>) -> bool {
        if self.free.len() < n {
            return false;
        }
        out.extend(self.free.drain(..n));
        true
    }

    /// Returns one address, normalised to its chunk start plus headroom.
    #[inline]
    pub fn release(&mut self, addr: u64) {
        debug_assert!(self.free.len() < self.capacity);
        self.free.push_back((addr & self.chunk_mask) + self.headroom);
    }

    pub fn release_all(&mut self, addrs: impl IntoIterator<Item = u64>) {
        for addr in addrs {
            self.release(addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_all_or_nothing() {
        let mut pool = AddrPool::new(2048, 4, 0);
        let mut out = Vec::new();
        assert!(!pool.acquire(5, &mut out));
        assert!(out.is_empty());
        assert_eq!(pool.available(), 4);
        assert!(pool.acquire(3, &mut out));
        assert_eq!(out, vec![0, 2048, 4096]);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn release_drops_residual_offsets() {
        let mut pool = AddrPool::new(4096, 2, 64);
        let mut out = Vec::new();
        assert!(pool.acquire(2, &mut out));
        // data address as reported by an RX descriptor
        pool.release(4096 + 64 + 256);
        pool.release_all([64 + 17]);
        assert!(pool.acquire(2, &mut out));
        assert_eq!(&out[2..], &[4096 + 64, 64]);
        assert_eq!(pool.capacity(), 2);
    }
}
