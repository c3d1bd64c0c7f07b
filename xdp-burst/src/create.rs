//! # AF_XDP Queue Creation
//!
//! ## Purpose
//!
//! A queue needs a socket bound to one NIC queue and the four rings mapped from it. This file
//! defines the [`QueueFactory`] seam that produces them and the Linux implementation,
//! [`XdpQueueFactory`].
//!
//! ## How it works
//!
//! 1. Creates a raw `AF_XDP` socket.
//! 2. Registers the UMEM with `XDP_UMEM_REG` unless another socket already did; in that case
//!    the bind below carries `XDP_SHARED_UMEM` and the owner's descriptor.
//! 3. Sizes the Fill, Completion, RX and TX rings with `setsockopt`.
//! 4. Reads the ring offsets (`XDP_MMAP_OFFSETS`) and maps all four rings.
//! 5. Binds to the interface queue with the requested flags.
//!
//! Program attachment is left to the caller; the returned socket's descriptor is what goes
//! into the XSK map.
//!
//! ## Main components
//!
//! - `QueueFactory`: creation seam used by `XskQueue::setup`.
//! - `XdpQueueFactory`: the kernel-backed implementation.
//! - `BindFlags`, `RingSizes`, `XskRings`, `Capabilities`.

use crate::registry::QueueKey;
use crate::ring::{Ring, RingType, XdpDesc};
use crate::socket::{XskFd, XskSocket};
use crate::umem::UmemRegion;
use bitflags::bitflags;
use std::io;
use std::mem::size_of;
use std::sync::Arc;

/// `NETDEV_XDP_ACT_XSK_ZEROCOPY` bit of the driver feature flags.
const XDP_ACT_XSK_ZEROCOPY: u32 = 8;

bitflags! {
    /// `sockaddr_xdp.sxdp_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BindFlags: u16 {
        const SHARED_UMEM = libc::XDP_SHARED_UMEM;
        const COPY = libc::XDP_COPY;
        const ZEROCOPY = libc::XDP_ZEROCOPY;
        const USE_NEED_WAKEUP = libc::XDP_USE_NEED_WAKEUP;
    }
}

/// Entries of each ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSizes {
    pub fill: u32,
    pub completion: u32,
    pub rx: u32,
    pub tx: u32,
}

impl RingSizes {
    /// All four rings of `size` entries.
    pub fn uniform(size: u32) -> Self {
        RingSizes {
            fill: size,
            completion: size,
            rx: size,
            tx: size,
        }
    }
}

/// What the interface driver supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Driver-level zero-copy (`XDP_ZEROCOPY` bind).
    pub driver_zero_copy: bool,
    /// UMEM registration with `XDP_UMEM_UNALIGNED_CHUNK_FLAG`.
    pub unaligned_chunks: bool,
}

/// Rings and socket of one bound queue.
pub struct XskRings {
    pub fill: Ring<u64>,
    pub completion: Ring<u64>,
    pub rx: Ring<XdpDesc>,
    pub tx: Ring<XdpDesc>,
    pub socket: Arc<dyn XskSocket>,
}

/// Creates bound sockets with their rings.
pub trait QueueFactory: Send + Sync {
    fn capabilities(&self, if_index: u32) -> io::Result<Capabilities>;

    /// Creates a socket for `key` over `umem`. If `umem` has no owner yet the new socket
    /// registers it; otherwise `flags` contains `SHARED_UMEM` and the socket binds to the
    /// owner's registration.
    fn create(
        &self,
        umem: &UmemRegion,
        key: QueueKey,
        sizes: &RingSizes,
        flags: BindFlags,
    ) -> io::Result<XskRings>;
}

/// Kernel-backed [`QueueFactory`].
#[derive(Debug, Default, Clone, Copy)]
pub struct XdpQueueFactory;

impl QueueFactory for XdpQueueFactory {
    fn capabilities(&self, if_index: u32) -> io::Result<Capabilities> {
        let features = xdp_features(if_index).unwrap_or_else(|e| {
            log::debug!("interface {if_index}: {e}, assuming no driver zero-copy");
            0
        });
        Ok(Capabilities {
            driver_zero_copy: features & XDP_ACT_XSK_ZEROCOPY != 0,
            unaligned_chunks: true,
        })
    }

    fn create(
        &self,
        umem: &UmemRegion,
        key: QueueKey,
        sizes: &RingSizes,
        flags: BindFlags,
    ) -> io::Result<XskRings> {
        check_capability()?;
        let socket = XskFd::open()?;
        let raw_fd = socket.raw_fd();

        let shared_fd = match umem.owner() {
            Some(owner) if flags.contains(BindFlags::SHARED_UMEM) => owner.raw_fd() as u32,
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "UMEM is already registered; bind must request SHARED_UMEM",
                ));
            }
            None => {
                register_umem(raw_fd, umem)?;
                0
            }
        };

        // Fill and Completion are per socket, also for sharers.
        RingType::Fill.set_size(raw_fd, sizes.fill)?;
        RingType::Completion.set_size(raw_fd, sizes.completion)?;
        RingType::Rx.set_size(raw_fd, sizes.rx)?;
        RingType::Tx.set_size(raw_fd, sizes.tx)?;

        let offsets = ring_offsets(raw_fd)?;
        let fill = RingType::Fill.mmap(raw_fd, &offsets, sizes.fill)?;
        let completion = RingType::Completion.mmap(raw_fd, &offsets, sizes.completion)?;
        let rx = RingType::Rx.mmap(raw_fd, &offsets, sizes.rx)?;
        let tx = RingType::Tx.mmap(raw_fd, &offsets, sizes.tx)?;

        let sxdp = libc::sockaddr_xdp {
            sxdp_family: libc::AF_XDP as libc::sa_family_t,
            sxdp_flags: flags.bits(),
            sxdp_ifindex: key.if_index,
            sxdp_queue_id: key.queue_index,
            sxdp_shared_umem_fd: shared_fd,
        };
        if unsafe {
            libc::bind(
                raw_fd,
                &sxdp as *const _ as *const libc::sockaddr,
                size_of::<libc::sockaddr_xdp>() as libc::socklen_t,
            ) < 0
        } {
            return Err(io::Error::other(format!(
                "Failed to bind to {key}: {}",
                io::Error::last_os_error()
            )));
        }
        log::debug!("socket {raw_fd} bound to {key} with {flags:?}");

        Ok(XskRings {
            fill,
            completion,
            rx,
            tx,
            socket: Arc::new(socket),
        })
    }
}

fn check_capability() -> io::Result<()> {
    use caps::{CapSet, Capability};
    match caps::has_cap(None, CapSet::Effective, Capability::CAP_NET_RAW) {
        Ok(true) => Ok(()),
        Ok(false) => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "CAP_NET_RAW is required to create AF_XDP sockets",
        )),
        Err(e) => {
            log::debug!("cannot read process capabilities: {e}");
            Ok(())
        }
    }
}

/// Registers `umem` with the kernel on socket `raw_fd`.
fn register_umem(raw_fd: libc::c_int, umem: &UmemRegion) -> io::Result<()> {
    let params = umem.registration();
    let reg = unsafe {
        libc::xdp_umem_reg {
            addr: params.addr,
            len: params.len,
            chunk_size: params.chunk_size,
            headroom: params.headroom,
            flags: params.flags,
            ..std::mem::zeroed()
        }
    };
    unsafe {
        if libc::setsockopt(
            raw_fd,
            libc::SOL_XDP,
            libc::XDP_UMEM_REG,
            &reg as *const _ as *const libc::c_void,
            size_of::<libc::xdp_umem_reg>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::other(format!(
                "Failed to register UMEM: {}",
                io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// Retrieves the memory map offsets of the four rings.
pub fn ring_offsets(raw_fd: libc::c_int) -> io::Result<libc::xdp_mmap_offsets> {
    let mut offsets: libc::xdp_mmap_offsets = unsafe { std::mem::zeroed() };
    let mut optlen = size_of::<libc::xdp_mmap_offsets>() as libc::socklen_t;
    unsafe {
        if libc::getsockopt(
            raw_fd,
            libc::SOL_XDP,
            libc::XDP_MMAP_OFFSETS,
            &mut offsets as *mut _ as *mut libc::c_void,
            &mut optlen,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(offsets)
}

/// Queries the XDP feature flags of the interface driver.
pub fn xdp_features(if_index: u32) -> io::Result<u32> {
    Ok(unsafe {
        let mut opts: libbpf_sys::bpf_xdp_query_opts = std::mem::zeroed();
        opts.sz = size_of::<libbpf_sys::bpf_xdp_query_opts>() as u64;
        if libbpf_sys::bpf_xdp_query(
            if_index as libc::c_int,
            libbpf_sys::XDP_FLAGS_DRV_MODE as libc::c_int,
            &mut opts,
        ) < 0
        {
            return Err(io::Error::other(format!(
                "Failed to query XDP features: {}",
                io::Error::last_os_error()
            )));
        }
        opts.feature_flags as u32
    })
}
