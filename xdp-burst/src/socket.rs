//! # AF_XDP Socket Syscall Surface
//!
//! ## Purpose
//!
//! Everything the data path asks of the kernel besides ring memory goes through a handful of
//! syscalls on the socket: a zero-length `sendto` to start transmission, `poll` or a
//! zero-length `recvfrom` to get the kernel to refill RX, the busy-poll socket options, and
//! `XDP_STATISTICS`. [`XskSocket`] captures that surface so queues can run against the real
//! socket ([`XskFd`]) or a scripted one.
//!
//! ## Main components
//!
//! - `XskSocket`: the syscall trait used by queues, the wakeup policy and the kick loop.
//! - `XskFd`: Linux implementation over an owned `AF_XDP` file descriptor.
//! - `SocketOption`: the busy-poll related `SOL_SOCKET` options.
//! - `XdpStatistics`: ABI copy of `struct xdp_statistics`.

use static_assertions::const_assert_eq;
use std::fmt;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

// Not exported by every libc target yet.
const SO_PREFER_BUSY_POLL: libc::c_int = 69;
const SO_BUSY_POLL_BUDGET: libc::c_int = 70;

/// Busy-poll related `SOL_SOCKET` options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    PreferBusyPoll,
    BusyPoll,
    BusyPollBudget,
}

impl SocketOption {
    fn as_raw(self) -> libc::c_int {
        match self {
            SocketOption::PreferBusyPoll => SO_PREFER_BUSY_POLL,
            SocketOption::BusyPoll => libc::SO_BUSY_POLL,
            SocketOption::BusyPollBudget => SO_BUSY_POLL_BUDGET,
        }
    }
}

/// Kernel-side socket counters (`struct xdp_statistics`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XdpStatistics {
    /// Dropped for reasons other than invalid descriptors.
    pub rx_dropped: u64,
    pub rx_invalid_descs: u64,
    pub tx_invalid_descs: u64,
    /// Dropped because the RX ring was full.
    pub rx_ring_full: u64,
    /// Times the Fill ring was found empty.
    pub rx_fill_ring_empty_descs: u64,
    pub tx_ring_empty_descs: u64,
}

const_assert_eq!(size_of::<XdpStatistics>(), 48);

/// Syscall surface of one AF_XDP socket.
///
/// Errors are returned as they come from the kernel (`raw_os_error` set) so callers can tell
/// transient conditions from real failures.
pub trait XskSocket: Send + Sync + fmt::Debug {
    /// Descriptor to insert into an XSK map or to wait on.
    fn raw_fd(&self) -> RawFd;

    /// Waits up to `timeout` for the socket to become readable.
    fn poll_readable(&self, timeout: Duration) -> io::Result<bool>;

    /// Zero-length non-blocking send; makes the kernel process the TX ring.
    fn send_kick(&self) -> io::Result<()>;

    /// Zero-length non-blocking receive; drives busy-poll processing of RX.
    fn recv_probe(&self) -> io::Result<()>;

    fn set_option(&self, option: SocketOption, value: u32) -> io::Result<()>;

    fn statistics(&self) -> io::Result<XdpStatistics>;
}

/// Owned `AF_XDP` socket.
#[derive(Debug)]
pub struct XskFd {
    fd: OwnedFd,
}

impl XskFd {
    /// Creates a raw `AF_XDP` socket.
    pub fn open() -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::other(format!(
                "Failed to create AF_XDP socket: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(XskFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }
}

impl XskSocket for XskFd {
    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn poll_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut fds = [libc::pollfd {
            fd: self.raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        match unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) } {
            n if n < 0 => Err(io::Error::last_os_error()),
            0 => Ok(false),
            _ => Ok(fds[0].revents & libc::POLLIN != 0),
        }
    }

    fn send_kick(&self) -> io::Result<()> {
        let ret = unsafe {
            libc::sendto(
                self.raw_fd(),
                ptr::null(),
                0,
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                ptr::null(),
                0,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv_probe(&self) -> io::Result<()> {
        let ret = unsafe {
            libc::recvfrom(
                self.raw_fd(),
                ptr::null_mut(),
                0,
                libc::MSG_DONTWAIT,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_option(&self, option: SocketOption, value: u32) -> io::Result<()> {
        let value = value as libc::c_int;
        let res = unsafe {
            libc::setsockopt(
                self.raw_fd(),
                libc::SOL_SOCKET,
                option.as_raw(),
                &value as *const _ as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn statistics(&self) -> io::Result<XdpStatistics> {
        let mut stats = XdpStatistics::default();
        let mut optlen = size_of::<XdpStatistics>() as libc::socklen_t;
        let res = unsafe {
            libc::getsockopt(
                self.raw_fd(),
                libc::SOL_XDP,
                libc::XDP_STATISTICS,
                &mut stats as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        };
        if res < 0 {
            return Err(io::Error::other(format!(
                "Failed to read XDP statistics: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(stats)
    }
}
