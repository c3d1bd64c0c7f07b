//! # UMEM Regions
//!
//! ## Purpose
//!
//! A UMEM is the memory area the kernel reads and writes packets in. It is registered once with
//! `XDP_UMEM_REG` on the first socket that uses it; further sockets can bind to it with
//! `XDP_SHARED_UMEM`. [`UmemRegion`] describes such an area and keeps it alive for as long as
//! any queue refers to it (`Arc<UmemRegion>`).
//!
//! ## How it works
//!
//! Two layouts exist, one per buffer mode:
//!
//! - copy mode: a private anonymous mapping cut into `frame_count` aligned chunks of
//!   `frame_size` bytes; addresses are chunk offsets plus `frame_headroom`;
//! - zero-copy mode: the backing memory of a [`Mempool`] registered as is, with unaligned chunks
//!   of the pool element size. The frame headroom covers the pool header, the buffer metadata
//!   and the buffer headroom, so the kernel writes packet data where an `Mbuf` expects it.
//!
//! The socket that registered the region is kept in `owner`; sharers pass its descriptor in
//! `sxdp_shared_umem_fd`.
//!
//! Pool buffers a closing zero-copy queue left on the kernel rings are parked on the region.
//! The kernel lets go of them only once every socket bound to the UMEM is closed, so they go
//! back to the pool when the region itself is dropped, after the owner socket.
//!
//! ## Main components
//!
//! - `UmemRegion`: geometry, registration parameters, owner socket.
//! - `UmemReg`: what is passed to `XDP_UMEM_REG`.

use crate::config::BufferMode;
use crate::mempool::{MBUF_HEADROOM, MBUF_META_SIZE, Mempool, PoolId};
use crate::mmap::{OwnedMmap, page_size};
use crate::socket::XskSocket;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Headroom the kernel always leaves in front of received data (`XDP_PACKET_HEADROOM`).
pub const XDP_PACKET_HEADROOM: u32 = 256;
/// Smallest chunk the kernel accepts.
pub const MIN_CHUNK_SIZE: u32 = 2048;
/// Chunks of a full-size region; a pool of this many buffers supports one sharer.
const CHUNKS_PER_SHARER: u32 = 4096;

/// Parameters of the `XDP_UMEM_REG` socket option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UmemReg {
    pub addr: u64,
    pub len: u64,
    pub chunk_size: u32,
    pub headroom: u32,
    pub flags: u32,
}

enum UmemArea {
    Owned(OwnedMmap),
    Overlay(Arc<Mempool>),
}

pub struct UmemRegion {
    area: UmemArea,
    chunk_size: u32,
    chunk_count: u32,
    frame_headroom: u32,
    flags: u32,
    max_sharers: u32,
    owner: OnceLock<Arc<dyn XskSocket>>,
    /// Pool elements closed queues left with the kernel.
    parked: Mutex<Vec<u32>>,
}

impl fmt::Debug for UmemRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UmemRegion")
            .field("mode", &self.mode())
            .field("base", &self.base_address())
            .field("chunk_size", &self.chunk_size)
            .field("chunk_count", &self.chunk_count)
            .field("frame_headroom", &self.frame_headroom)
            .field("registered", &self.owner.get().is_some())
            .finish()
    }
}

impl UmemRegion {
    /// Allocates a private copy-mode region of `frame_count` chunks.
    pub fn allocate(
        frame_size: u32,
        frame_count: u32,
        frame_headroom: u32,
        huge_page: Option<bool>,
    ) -> io::Result<Self> {
        check_chunk_size(frame_size)?;
        if !frame_size.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("UMEM chunk size {frame_size} is not a power of two"),
            ));
        }
        if frame_count == 0 || frame_headroom + XDP_PACKET_HEADROOM >= frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "UMEM of {frame_count} chunks of {frame_size} bytes cannot hold headroom {frame_headroom}"
                ),
            ));
        }
        let mem = OwnedMmap::anonymous(frame_size as usize * frame_count as usize, huge_page)
            .map_err(|e| io::Error::other(format!("Failed to allocate UMEM: {e}")))?;
        log::debug!(
            "UMEM: {frame_count} chunks of {frame_size} bytes at {:p} (huge pages: {})",
            mem.as_void_ptr(),
            mem.is_huge()
        );
        Ok(UmemRegion {
            area: UmemArea::Owned(mem),
            chunk_size: frame_size,
            chunk_count: frame_count,
            frame_headroom,
            flags: 0,
            max_sharers: 1,
            owner: OnceLock::new(),
            parked: Mutex::new(Vec::new()),
        })
    }

    /// Describes the backing memory of `pool` as an unaligned-chunk region.
    pub fn overlay(pool: &Arc<Mempool>) -> io::Result<Self> {
        let chunk_size = u32::try_from(pool.elt_size()).unwrap_or(u32::MAX);
        check_chunk_size(chunk_size)?;
        let frame_headroom =
            (pool.header_size() + MBUF_META_SIZE) as u32 + MBUF_HEADROOM as u32;
        if frame_headroom + XDP_PACKET_HEADROOM >= chunk_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "mempool {}: element of {chunk_size} bytes leaves no room after headroom",
                    pool.name()
                ),
            ));
        }
        Ok(UmemRegion {
            area: UmemArea::Overlay(pool.clone()),
            chunk_size,
            chunk_count: pool.capacity(),
            frame_headroom,
            flags: libc::XDP_UMEM_UNALIGNED_CHUNK_FLAG,
            max_sharers: (pool.capacity() / CHUNKS_PER_SHARER).max(1),
            owner: OnceLock::new(),
            parked: Mutex::new(Vec::new()),
        })
    }

    pub fn mode(&self) -> BufferMode {
        match self.area {
            UmemArea::Owned(_) => BufferMode::Copy,
            UmemArea::Overlay(_) => BufferMode::ZeroCopy,
        }
    }

    pub fn base_address(&self) -> *mut u8 {
        match &self.area {
            UmemArea::Owned(mem) => mem.as_u8_ptr(),
            UmemArea::Overlay(pool) => pool.base_address(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.area {
            UmemArea::Owned(mem) => mem.len(),
            UmemArea::Overlay(pool) => pool.region_len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Bytes in front of packet data the kernel leaves unused in every chunk.
    pub fn frame_headroom(&self) -> u32 {
        self.frame_headroom
    }

    /// Largest packet a chunk can carry.
    pub fn data_room(&self) -> u32 {
        self.chunk_size - self.frame_headroom - XDP_PACKET_HEADROOM
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn is_unaligned(&self) -> bool {
        self.flags & libc::XDP_UMEM_UNALIGNED_CHUNK_FLAG != 0
    }

    /// The overlaid buffer pool in zero-copy mode.
    pub fn pool(&self) -> Option<&Arc<Mempool>> {
        match &self.area {
            UmemArea::Owned(_) => None,
            UmemArea::Overlay(pool) => Some(pool),
        }
    }

    pub fn pool_id(&self) -> Option<PoolId> {
        self.pool().map(|pool| pool.id())
    }

    /// Queues allowed to bind to this region.
    pub fn max_sharers(&self) -> u32 {
        self.max_sharers
    }

    pub fn registration(&self) -> UmemReg {
        UmemReg {
            addr: self.base_address() as u64,
            len: self.len() as u64,
            chunk_size: self.chunk_size,
            headroom: self.frame_headroom,
            flags: self.flags,
        }
    }

    /// The socket the region was registered on, once registered.
    pub fn owner(&self) -> Option<&Arc<dyn XskSocket>> {
        self.owner.get()
    }

    /// Records the registering socket. Returns false if the region already had one.
    pub(crate) fn set_owner(&self, socket: Arc<dyn XskSocket>) -> bool {
        self.owner.set(socket).is_ok()
    }

    /// Hands pool elements still owned by the kernel to the region, to be freed on drop.
    pub(crate) fn park(&self, indices: impl IntoIterator<Item = u32>) {
        self.parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(indices);
    }

    /// Number of parked pool elements.
    pub fn parked(&self) -> usize {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Queues currently holding the region.
    pub fn refcount(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    /// Aligned-mode chunk base of an address.
    #[inline]
    pub(crate) fn chunk_base(&self, addr: u64) -> u64 {
        addr & !(self.chunk_size as u64 - 1)
    }

    /// Bytes at `pos..pos + len` from the region base, or `None` if out of range.
    ///
    /// # Safety
    ///
    /// The caller must own the chunk the range lies in (not on any kernel ring).
    pub(crate) unsafe fn bytes(&self, pos: u64, len: usize) -> Option<&[u8]> {
        let end = pos.checked_add(len as u64)?;
        if end > self.len() as u64 {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(self.base_address().add(pos as usize), len) })
    }

    /// Mutable variant of [`UmemRegion::bytes`], same contract.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self, pos: u64, len: usize) -> Option<&mut [u8]> {
        let end = pos.checked_add(len as u64)?;
        if end > self.len() as u64 {
            return None;
        }
        Some(unsafe {
            std::slice::from_raw_parts_mut(self.base_address().add(pos as usize), len)
        })
    }
}

impl Drop for UmemRegion {
    fn drop(&mut self) {
        // The socket goes first: the kernel owns parked buffers until it is closed.
        drop(self.owner.take());
        let parked = std::mem::take(
            self.parked
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if let UmemArea::Overlay(pool) = &self.area {
            for index in &parked {
                // SAFETY: every socket bound to the region is closed, and each element was
                // parked once by the queue that gave it to the kernel.
                unsafe { pool.free_raw(*index) };
            }
        }
        log::debug!(
            "UMEM region at {:p} released ({} mode, {} buffers returned)",
            self.base_address(),
            self.mode(),
            parked.len()
        );
    }
}

fn check_chunk_size(chunk_size: u32) -> io::Result<()> {
    let page = page_size() as u32;
    if !(MIN_CHUNK_SIZE..=page).contains(&chunk_size) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("UMEM chunk size {chunk_size} outside {MIN_CHUNK_SIZE}..={page}"),
        ));
    }
    Ok(())
}
