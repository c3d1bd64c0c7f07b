//! # Packet Buffer Pool
//!
//! ## Purpose
//!
//! The application side of the engine works with [`Mbuf`]s: fixed-size packet buffers handed
//! out by a [`Mempool`]. In copy mode the engine copies between UMEM chunks and mbufs; in
//! zero-copy mode the whole pool is registered as the UMEM and mbufs travel through the rings
//! themselves.
//!
//! ## How it works
//!
//! A pool is one page-aligned anonymous mapping cut into `capacity` elements of `elt_size`
//! bytes. Each element is laid out as
//!
//! ```text
//! | pool header | buffer metadata | headroom | data ... |
//! ^ element     ^ object          ^ buffer
//! ```
//!
//! `header_size` and the metadata block are never touched by the engine; they exist so that
//! the buffer geometry matches what the kernel is told at UMEM registration (frame headroom).
//! Free elements are tracked by index. An `Mbuf` owns its element until it is dropped (which
//! returns it to the pool) or converted with `into_raw` while the kernel holds it.
//!
//! ## Main components
//!
//! - `Mempool`: allocator, `alloc_bulk` / `free_bulk`, geometry for UMEM overlay.
//! - `Mbuf`: owning handle with data offset and length.
//! - `PoolId`: identity used by the shared UMEM registry.

use crate::mmap::OwnedMmap;
use std::fmt;
use std::io;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Bytes reserved in front of every object for the pool's own use.
pub const POOL_HEADER_SIZE: usize = 64;
/// Bytes of per-buffer metadata between the object start and the buffer.
pub const MBUF_META_SIZE: usize = 128;
/// Default headroom in front of packet data.
pub const MBUF_HEADROOM: u16 = 128;
/// Default buffer size (headroom included).
pub const DEFAULT_DATA_ROOM: u16 = 2048 + MBUF_HEADROOM;

const ELT_ALIGN: usize = 64;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(u64);

pub struct Mempool {
    id: PoolId,
    name: String,
    mem: OwnedMmap,
    elt_size: usize,
    header_size: usize,
    data_room: u16,
    capacity: u32,
    free: Mutex<Vec<u32>>,
}

impl fmt::Debug for Mempool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mempool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("elt_size", &self.elt_size)
            .field("available", &self.available())
            .finish()
    }
}

impl Mempool {
    /// Creates a pool of `capacity` buffers with `data_room` bytes each (headroom included).
    pub fn new(name: &str, capacity: u32, data_room: u16) -> io::Result<Arc<Self>> {
        Self::with_options(name, capacity, data_room, Some(false))
    }

    pub fn with_options(
        name: &str,
        capacity: u32,
        data_room: u16,
        huge_page: Option<bool>,
    ) -> io::Result<Arc<Self>> {
        if capacity == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mempool {name}: capacity must not be zero"),
            ));
        }
        if data_room <= MBUF_HEADROOM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mempool {name}: data room {data_room} leaves no space after headroom"),
            ));
        }
        let raw = POOL_HEADER_SIZE + MBUF_META_SIZE + data_room as usize;
        let elt_size = (raw + ELT_ALIGN - 1) & !(ELT_ALIGN - 1);
        let mem = OwnedMmap::anonymous(elt_size * capacity as usize, huge_page)
            .map_err(|e| io::Error::other(format!("Failed to allocate mempool {name}: {e}")))?;
        log::debug!(
            "mempool {name}: {capacity} x {elt_size} bytes at {:p}",
            mem.as_void_ptr()
        );
        Ok(Arc::new(Mempool {
            id: PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.to_string(),
            mem,
            elt_size,
            header_size: POOL_HEADER_SIZE,
            data_room,
            capacity,
            free: Mutex::new((0..capacity).rev().collect()),
        }))
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Buffers currently free.
    pub fn available(&self) -> usize {
        self.free_list().len()
    }

    /// Buffers currently held by the application or the kernel.
    pub fn in_use(&self) -> usize {
        self.capacity as usize - self.available()
    }

    pub fn elt_size(&self) -> usize {
        self.elt_size
    }

    /// Bytes between an element start and its object.
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Buffer size including headroom.
    pub fn data_room(&self) -> u16 {
        self.data_room
    }

    /// Start of the backing memory; page aligned.
    pub fn base_address(&self) -> *mut u8 {
        self.mem.as_u8_ptr()
    }

    /// Length of the backing memory.
    pub fn region_len(&self) -> usize {
        self.mem.len()
    }

    fn free_list(&self) -> MutexGuard<'_, Vec<u32>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn alloc(self: &Arc<Self>) -> Option<Mbuf> {
        let index = self.free_list().pop()?;
        Some(Mbuf::fresh(self.clone(), index))
    }

    /// Appends exactly `n` buffers to `out`, or none at all.
    pub fn alloc_bulk(self: &Arc<Self>, n: usize, out: &mut Vec<Mbuf>) -> bool {
        let mut free = self.free_list();
        if free.len() < n {
            return false;
        }
        let start = free.len() - n;
        out.extend(
            free.drain(start..)
                .rev()
                .map(|index| Mbuf::fresh(self.clone(), index)),
        );
        true
    }

    /// Returns all buffers in `bufs` at once; buffers of other pools are dropped individually.
    pub fn free_bulk(&self, bufs: &mut Vec<Mbuf>) {
        let mut foreign = Vec::new();
        {
            let mut free = self.free_list();
            for mbuf in bufs.drain(..) {
                if mbuf.pool.id == self.id {
                    free.push(mbuf.into_raw());
                } else {
                    foreign.push(mbuf);
                }
            }
        }
        drop(foreign);
    }

    fn put(&self, index: u32) {
        debug_assert!(index < self.capacity);
        self.free_list().push(index);
    }

    /// Returns an element the engine held in raw form.
    ///
    /// # Safety
    ///
    /// `index` must have come from [`Mbuf::into_raw`] on this pool and not been returned since.
    pub(crate) unsafe fn free_raw(&self, index: u32) {
        self.put(index);
    }

    /// Rebuilds the handle of an element the engine held in raw form, with default geometry.
    ///
    /// # Safety
    ///
    /// Same contract as [`Mempool::free_raw`].
    pub(crate) unsafe fn from_raw(self: &Arc<Self>, index: u32) -> Mbuf {
        Mbuf::fresh(self.clone(), index)
    }

    /// Offset of element `index` from the pool base.
    #[inline]
    pub(crate) fn element_offset(&self, index: u32) -> u64 {
        index as u64 * self.elt_size as u64
    }

    /// Element index for an offset from the pool base, if it is an element start.
    #[inline]
    pub(crate) fn element_index(&self, offset: u64) -> Option<u32> {
        let elt = self.elt_size as u64;
        let index = offset / elt;
        (offset % elt == 0 && index < self.capacity as u64).then_some(index as u32)
    }

    /// Offset of the buffer (start of headroom) from the element start.
    #[inline]
    pub(crate) fn buffer_offset(&self) -> usize {
        self.header_size + MBUF_META_SIZE
    }

    #[inline]
    fn buffer_ptr(&self, index: u32) -> *mut u8 {
        unsafe {
            self.base_address()
                .add(self.element_offset(index) as usize + self.buffer_offset())
        }
    }
}

/// A packet buffer owned by the application.
pub struct Mbuf {
    pool: Arc<Mempool>,
    index: u32,
    data_off: u16,
    len: u32,
}

impl fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mbuf")
            .field("pool", &self.pool.name)
            .field("index", &self.index)
            .field("data_off", &self.data_off)
            .field("len", &self.len)
            .finish()
    }
}

impl Mbuf {
    fn fresh(pool: Arc<Mempool>, index: u32) -> Self {
        Mbuf {
            pool,
            index,
            data_off: MBUF_HEADROOM,
            len: 0,
        }
    }

    pub fn pool(&self) -> &Arc<Mempool> {
        &self.pool
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool.id
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes in front of the packet data.
    pub fn headroom(&self) -> u16 {
        self.data_off
    }

    /// Bytes available after the packet data.
    pub fn tailroom(&self) -> usize {
        self.pool.data_room as usize - self.data_off as usize - self.len as usize
    }

    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data_ptr(), self.len as usize) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data_ptr(), self.len as usize) }
    }

    /// Grows the packet by `n` bytes and returns the new tail, or `None` without tailroom.
    pub fn append(&mut self, n: usize) -> Option<&mut [u8]> {
        if n > self.tailroom() {
            return None;
        }
        let old = self.len as usize;
        self.len += n as u32;
        Some(&mut self.data_mut()[old..])
    }

    /// Appends `bytes`; false (and nothing written) if they do not fit.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> bool {
        match self.append(bytes.len()) {
            Some(tail) => {
                tail.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Truncates the packet to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len as u32);
    }

    #[inline]
    pub(crate) fn data_ptr(&self) -> *mut u8 {
        unsafe { self.pool.buffer_ptr(self.index).add(self.data_off as usize) }
    }

    /// Sets data offset and length. Returns false if they do not fit the buffer.
    pub(crate) fn set_data(&mut self, data_off: u16, len: u32) -> bool {
        if data_off as usize + len as usize > self.pool.data_room as usize {
            return false;
        }
        self.data_off = data_off;
        self.len = len;
        true
    }

    /// Copies `src` to the start of an empty buffer at the default headroom.
    pub(crate) fn fill_from(&mut self, src: &[u8]) -> bool {
        if !self.set_data(MBUF_HEADROOM, src.len() as u32) {
            return false;
        }
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.data_ptr(), src.len()) };
        true
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// Gives up the handle without freeing the element; see [`Mempool::from_raw`].
    pub(crate) fn into_raw(self) -> u32 {
        let mut this = ManuallyDrop::new(self);
        unsafe { ptr::drop_in_place(&mut this.pool) };
        this.index
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        self.pool.put(self.index);
    }
}
