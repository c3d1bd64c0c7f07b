//! # Owned Memory Mappings
//!
//! ## Purpose
//!
//! Every piece of memory the engine shares with the kernel is a mapping: the copy-mode UMEM,
//! the backing store of a [`Mempool`](crate::mempool::Mempool) that zero-copy mode registers as
//! UMEM, and the four AF_XDP rings. This module owns those mappings and releases them on drop.
//!
//! ## How it works
//!
//! `OwnedMmap` wraps the pointer/length pair returned by `libc::mmap` and calls `munmap` in
//! its `Drop`. Anonymous mappings are page aligned and zero filled, which is what the kernel
//! requires from a UMEM. Huge pages are used when requested, or when `/proc/meminfo` reports
//! free 2MB pages and the caller left the choice open.
//!
//! ## Main components
//!
//! - `OwnedMmap`: owner of one mapped region.
//! - `page_size()`: the system page size.
//! - `get_hugepage_info()`: parses `/proc/meminfo` for huge page availability.

use std::fs::File;
use std::io::{BufRead as _, BufReader};
use std::{io, ptr};

const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Owner of a memory-mapped region; unmapped on drop.
#[derive(Debug)]
pub struct OwnedMmap {
    ptr: *mut libc::c_void,
    len: usize,
    huge: bool,
}

// SAFETY: the mapping is plain memory; which thread may touch which bytes is decided by the
// ownership rules of the structures built on top of it (rings, chunks, pool elements).
unsafe impl Send for OwnedMmap {}
unsafe impl Sync for OwnedMmap {}

impl OwnedMmap {
    /// Takes ownership of an existing mapping, e.g. one returned for a ring by the kernel.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `mmap` with exactly `len` bytes and must not be unmapped elsewhere.
    pub unsafe fn from_raw(ptr: *mut libc::c_void, len: usize) -> Self {
        OwnedMmap {
            ptr,
            len,
            huge: false,
        }
    }

    /// Maps `size` bytes of anonymous, zeroed memory rounded up to the page size.
    ///
    /// With `huge_page == None` huge pages are used only if `/proc/meminfo` reports free 2MB
    /// pages; a failed huge page mapping in that case falls back to regular pages.
    pub fn anonymous(size: usize, huge_page: Option<bool>) -> io::Result<Self> {
        let huge = match huge_page {
            Some(yes) => yes,
            None => match get_hugepage_info() {
                Ok(HugePageInfo {
                    free: Some(free),
                    size_kb: Some(2048),
                    ..
                }) => free > 0,
                _ => false,
            },
        };
        match Self::map(size, huge) {
            Err(e) if huge && huge_page.is_none() => {
                log::debug!("huge page mapping failed ({e}), using regular pages");
                Self::map(size, false)
            }
            result => result,
        }
    }

    fn map(size: usize, huge: bool) -> io::Result<Self> {
        let page = if huge { HUGE_PAGE_SIZE } else { page_size() };
        let aligned_size = (size.max(1) + page - 1) & !(page - 1);
        let flags = libc::MAP_PRIVATE
            | libc::MAP_ANONYMOUS
            | if huge {
                libc::MAP_HUGETLB | libc::MAP_HUGE_2MB
            } else {
                0
            };
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(OwnedMmap {
            ptr,
            len: aligned_size,
            huge,
        })
    }

    pub fn as_void_ptr(&self) -> *mut libc::c_void {
        self.ptr
    }

    pub fn as_u8_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the mapping is backed by huge pages.
    pub fn is_huge(&self) -> bool {
        self.huge
    }
}

impl Drop for OwnedMmap {
    fn drop(&mut self) {
        if self.ptr != libc::MAP_FAILED && !self.ptr.is_null() {
            let res = unsafe { libc::munmap(self.ptr, self.len) };
            if res < 0 {
                log::error!("Failed to unmap memory: {}", io::Error::last_os_error());
            }
        }
    }
}

/// The size of a regular memory page.
pub fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

/// Contains information about the system's huge page configuration.
#[derive(Debug, Default)]
pub struct HugePageInfo {
    /// The size of a huge page in kilobytes.
    pub size_kb: Option<u64>,
    /// The total number of huge pages configured in the system.
    pub total: Option<u64>,
    /// The number of free (available) huge pages.
    pub free: Option<u64>,
}

/// Parses `/proc/meminfo` for `Hugepagesize`, `HugePages_Total` and `HugePages_Free`.
pub fn get_hugepage_info() -> io::Result<HugePageInfo> {
    let file = File::open("/proc/meminfo")?;
    let reader = BufReader::new(file);
    let mut info = HugePageInfo::default();
    for line in reader.lines() {
        let line = line?;
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_end_matches(" kB");
        match key.trim() {
            "Hugepagesize" => info.size_kb = Some(value.parse().map_err(io::Error::other)?),
            "HugePages_Total" => info.total = Some(value.parse().map_err(io::Error::other)?),
            "HugePages_Free" => info.free = Some(value.parse().map_err(io::Error::other)?),
            _ => {}
        }
    }
    Ok(info)
}
