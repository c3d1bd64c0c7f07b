//! # Single-Producer/Single-Consumer Descriptor Rings
//!
//! ## Purpose
//!
//! AF_XDP moves packets through four rings shared with the kernel: Fill and Completion carry
//! bare UMEM addresses (`u64`), RX and TX carry [`XdpDesc`] descriptors. Each ring has exactly
//! one producer and one consumer, so the protocol needs no locks, only ordered loads and stores
//! of two shared indices.
//!
//! ## How it works
//!
//! A ring is a power-of-two array plus `producer`, `consumer` and `flags` words living in the
//! same mapping. Indices are free-running `u32` counters; a slot is found by masking. Each side
//! keeps a cached copy of the other side's index and only touches the shared word when the
//! cached view is insufficient:
//!
//! - producer: `reserve` claims slots, the caller writes them, `submit` publishes them with a
//!   release store;
//! - consumer: `peek` claims published slots (acquire load), the caller reads them, `release`
//!   hands the space back with a release store.
//!
//! Rings come either from the kernel (`RingType::mmap`) or from an anonymous mapping with the
//! same layout (`Ring::anonymous`), in which case `peer()` yields the opposite side.
//!
//! ## Main components
//!
//! - `XdpDesc`: the RX/TX descriptor, ABI-compatible with `struct xdp_desc`.
//! - `Ring<T>`: one side of a ring.
//! - `RingType`: kernel ring kinds, sizing and mapping.

use crate::mmap::OwnedMmap;
use static_assertions::const_assert_eq;
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::{io, ptr};

/// Default number of descriptors in every ring.
pub const DEFAULT_RING_SIZE: u32 = 2048;

/// `XDP_RING_NEED_WAKEUP` flag bit of the ring flags word.
pub const RING_NEED_WAKEUP: u32 = libc::XDP_RING_NEED_WAKEUP;

/// RX/TX ring descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XdpDesc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

const_assert_eq!(size_of::<XdpDesc>(), 16);

impl XdpDesc {
    pub fn new(addr: u64, len: u32, options: u32) -> Self {
        XdpDesc { addr, len, options }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Not enough free slots for the reservation.
    RingFull,
    /// Nothing published to consume.
    RingEmpty,
    /// Ring size is zero or not a power of two.
    InvalidSize(u32),
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingError::RingFull => write!(f, "ring is full"),
            RingError::RingEmpty => write!(f, "ring is empty"),
            RingError::InvalidSize(n) => write!(f, "ring size {n} is not a power of two"),
        }
    }
}

impl std::error::Error for RingError {}

impl From<RingError> for io::Error {
    fn from(e: RingError) -> Self {
        match e {
            RingError::InvalidSize(_) => io::Error::new(io::ErrorKind::InvalidInput, e),
            _ => io::Error::new(io::ErrorKind::WouldBlock, e),
        }
    }
}

struct RingMmap<T> {
    area: Arc<OwnedMmap>,
    producer: *const AtomicU32,
    consumer: *const AtomicU32,
    flags: *const AtomicU32,
    desc: *mut T,
}

impl<T> Clone for RingMmap<T> {
    fn clone(&self) -> Self {
        RingMmap {
            area: self.area.clone(),
            producer: self.producer,
            consumer: self.consumer,
            flags: self.flags,
            desc: self.desc,
        }
    }
}

impl<T> RingMmap<T> {
    /// # Safety
    ///
    /// `offsets` must describe a ring of `T` that fits inside `area`.
    unsafe fn new(area: OwnedMmap, offsets: &libc::xdp_ring_offset) -> Self {
        let base = area.as_u8_ptr();
        unsafe {
            RingMmap {
                producer: base.add(offsets.producer as usize) as *const AtomicU32,
                consumer: base.add(offsets.consumer as usize) as *const AtomicU32,
                flags: base.add(offsets.flags as usize) as *const AtomicU32,
                desc: base.add(offsets.desc as usize) as *mut T,
                area: Arc::new(area),
            }
        }
    }
}

/// One side of an SPSC ring; which side is decided by the methods the owner calls.
pub struct Ring<T> {
    mmap: RingMmap<T>,
    size: u32,
    mask: u32,
    cached_prod: u32,
    cached_cons: u32,
}

// SAFETY: a `Ring` is one endpoint; the shared words are atomics and each descriptor slot is
// owned by exactly one side at a time through the index protocol.
unsafe impl<T: Send> Send for Ring<T> {}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("size", &self.size)
            .field("cached_prod", &self.cached_prod)
            .field("cached_cons", &self.cached_cons)
            .finish()
    }
}

const ANON_OFFSETS: libc::xdp_ring_offset = libc::xdp_ring_offset {
    producer: 0,
    consumer: 64,
    flags: 128,
    desc: 192,
};

impl<T: Copy> Ring<T> {
    fn with_mmap(mmap: RingMmap<T>, size: u32) -> Result<Self, RingError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(RingError::InvalidSize(size));
        }
        let mut ring = Ring {
            mmap,
            size,
            mask: size - 1,
            cached_prod: 0,
            cached_cons: 0,
        };
        ring.cached_prod = ring.load_producer();
        ring.cached_cons = ring.load_consumer();
        Ok(ring)
    }

    /// Maps a kernel ring of `size` entries from the socket `fd`.
    pub fn mmap(
        fd: libc::c_int,
        size: u32,
        pgoff: u64,
        offsets: &libc::xdp_ring_offset,
    ) -> io::Result<Self> {
        if size == 0 || !size.is_power_of_two() {
            return Err(RingError::InvalidSize(size).into());
        }
        let map_size = (offsets.desc as usize).saturating_add(size as usize * size_of::<T>());
        let map_addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                pgoff as libc::off_t,
            )
        };
        if map_addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let area = unsafe { OwnedMmap::from_raw(map_addr, map_size) };
        let mmap = unsafe { RingMmap::new(area, offsets) };
        Ok(Self::with_mmap(mmap, size)?)
    }

    /// Creates a ring in anonymous memory with the kernel's layout. Use [`Ring::peer`] to get
    /// the other endpoint.
    pub fn anonymous(size: u32) -> io::Result<Self> {
        if size == 0 || !size.is_power_of_two() {
            return Err(RingError::InvalidSize(size).into());
        }
        let len = ANON_OFFSETS.desc as usize + size as usize * size_of::<T>();
        let area = OwnedMmap::anonymous(len, Some(false))?;
        let mmap = unsafe { RingMmap::new(area, &ANON_OFFSETS) };
        Ok(Self::with_mmap(mmap, size)?)
    }

    /// Another endpoint over the same memory, starting from the currently published indices.
    pub fn peer(&self) -> Self {
        let mut ring = Ring {
            mmap: self.mmap.clone(),
            size: self.size,
            mask: self.mask,
            cached_prod: 0,
            cached_cons: 0,
        };
        ring.cached_prod = ring.load_producer();
        ring.cached_cons = ring.load_consumer();
        ring
    }

    pub fn capacity(&self) -> u32 {
        self.size
    }

    fn load_producer(&self) -> u32 {
        unsafe { (*self.mmap.producer).load(Ordering::Acquire) }
    }

    fn load_consumer(&self) -> u32 {
        unsafe { (*self.mmap.consumer).load(Ordering::Acquire) }
    }

    /// Published entries not yet released by the consumer, as seen in shared memory.
    pub fn occupancy(&self) -> u32 {
        self.load_producer().wrapping_sub(self.load_consumer())
    }

    pub fn flags(&self) -> u32 {
        unsafe { (*self.mmap.flags).load(Ordering::Relaxed) }
    }

    /// True when the kernel asked for an explicit wakeup on this ring.
    pub fn needs_wakeup(&self) -> bool {
        self.flags() & RING_NEED_WAKEUP != 0
    }

    /// Driver side of the flags word; the kernel owns it for mapped rings.
    pub fn set_need_wakeup(&self, on: bool) {
        let flags = unsafe { &*self.mmap.flags };
        if on {
            flags.fetch_or(RING_NEED_WAKEUP, Ordering::Release);
        } else {
            flags.fetch_and(!RING_NEED_WAKEUP, Ordering::Release);
        }
    }

    // Producer side

    /// Free slots, refreshing the cached consumer only if fewer than `wanted` are known free.
    pub fn free_slots(&mut self, wanted: u32) -> u32 {
        let free = self.size - self.cached_prod.wrapping_sub(self.cached_cons);
        if free >= wanted {
            return free;
        }
        self.cached_cons = self.load_consumer();
        self.size - self.cached_prod.wrapping_sub(self.cached_cons)
    }

    /// Claims `n` contiguous slots and returns the index of the first. All or nothing.
    pub fn reserve(&mut self, n: u32) -> Result<u32, RingError> {
        if self.free_slots(n) < n {
            return Err(RingError::RingFull);
        }
        let idx = self.cached_prod;
        self.cached_prod = self.cached_prod.wrapping_add(n);
        Ok(idx)
    }

    /// Gives back the last `n` reserved slots that were not written.
    pub fn cancel_reserve(&mut self, n: u32) {
        self.cached_prod = self.cached_prod.wrapping_sub(n);
    }

    /// Publishes `n` reserved slots to the consumer.
    pub fn submit(&mut self, n: u32) {
        let producer = unsafe { &*self.mmap.producer };
        let next = producer.load(Ordering::Relaxed).wrapping_add(n);
        producer.store(next, Ordering::Release);
    }

    // Consumer side

    /// Claims up to `n` published entries; returns `(count, first index)`.
    ///
    /// The shared producer index is read at most once, and only when the cached view holds
    /// fewer than `n` entries.
    pub fn peek(&mut self, n: u32) -> (u32, u32) {
        let mut entries = self.cached_prod.wrapping_sub(self.cached_cons);
        if entries < n {
            self.cached_prod = self.load_producer();
            entries = self.cached_prod.wrapping_sub(self.cached_cons);
        }
        let count = entries.min(n);
        let idx = self.cached_cons;
        self.cached_cons = self.cached_cons.wrapping_add(count);
        (count, idx)
    }

    /// Un-claims the last `n` peeked entries; they are returned again by the next `peek`.
    pub fn cancel_peek(&mut self, n: u32) {
        self.cached_cons = self.cached_cons.wrapping_sub(n);
    }

    /// Hands `n` consumed entries back to the producer.
    pub fn release(&mut self, n: u32) {
        let consumer = unsafe { &*self.mmap.consumer };
        let next = consumer.load(Ordering::Relaxed).wrapping_add(n);
        consumer.store(next, Ordering::Release);
    }

    // Slots

    #[inline]
    fn slot(&self, idx: u32) -> *mut T {
        unsafe { self.mmap.desc.add((idx & self.mask) as usize) }
    }

    /// Reads the entry at ring index `idx` (masked).
    #[inline]
    pub fn read(&self, idx: u32) -> T {
        unsafe { ptr::read_volatile(self.slot(idx)) }
    }

    /// Writes the entry at ring index `idx` (masked).
    #[inline]
    pub fn write(&mut self, idx: u32, value: T) {
        unsafe { ptr::write_volatile(self.slot(idx), value) }
    }

    /// Producer-side bookkeeping view: (cached producer, cached consumer).
    pub fn cached(&self) -> (u32, u32) {
        (self.cached_prod, self.cached_cons)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RingType {
    Tx,
    Rx,
    Fill,
    Completion,
}

impl RingType {
    fn as_index(&self) -> libc::c_int {
        match self {
            RingType::Tx => libc::XDP_TX_RING,
            RingType::Rx => libc::XDP_RX_RING,
            RingType::Fill => libc::XDP_UMEM_FILL_RING,
            RingType::Completion => libc::XDP_UMEM_COMPLETION_RING,
        }
    }

    fn as_offset(&self) -> u64 {
        match self {
            RingType::Tx => libc::XDP_PGOFF_TX_RING as u64,
            RingType::Rx => libc::XDP_PGOFF_RX_RING as u64,
            RingType::Fill => libc::XDP_UMEM_PGOFF_FILL_RING,
            RingType::Completion => libc::XDP_UMEM_PGOFF_COMPLETION_RING,
        }
    }

    /// Tells the kernel how many entries this ring of socket `raw_fd` has.
    pub fn set_size(self, raw_fd: libc::c_int, ring_size: u32) -> io::Result<()> {
        if !ring_size.is_power_of_two() {
            return Err(RingError::InvalidSize(ring_size).into());
        }
        let res = unsafe {
            libc::setsockopt(
                raw_fd,
                libc::SOL_XDP,
                self.as_index(),
                &ring_size as *const _ as *const libc::c_void,
                size_of::<u32>() as libc::socklen_t,
            )
        };
        if res < 0 {
            return Err(io::Error::other(format!(
                "Failed to size {self:?} ring: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn mmap<T: Copy>(
        self,
        raw_fd: libc::c_int,
        offsets: &libc::xdp_mmap_offsets,
        ring_size: u32,
    ) -> io::Result<Ring<T>> {
        let ring_offs = match self {
            RingType::Tx => &offsets.tx,
            RingType::Rx => &offsets.rx,
            RingType::Fill => &offsets.fr,
            RingType::Completion => &offsets.cr,
        };
        Ring::<T>::mmap(raw_fd, ring_size, self.as_offset(), ring_offs)
    }
}
