//! Queue configuration.
//!
//! Every knob is an `Option`; `None` selects the default listed on the field. Values are
//! checked once by [`XskConfig::validate`] when a queue is set up.

use crate::ring::DEFAULT_RING_SIZE;
use std::fmt;
use std::io;

/// UMEM chunk size in copy mode.
pub const DEFAULT_FRAME_SIZE: u32 = 4096;
/// Number of UMEM chunks in copy mode.
pub const DEFAULT_FRAME_COUNT: u32 = 4096;
/// Bytes left free in front of packet data in every copy-mode chunk.
pub const DEFAULT_FRAME_HEADROOM: u32 = 0;
/// `SO_BUSY_POLL_BUDGET` used when busy polling is not configured explicitly.
pub const DEFAULT_BUSY_BUDGET: u32 = 64;
/// `SO_BUSY_POLL` timeout in microseconds.
pub const DEFAULT_BUSY_TIMEOUT_US: u32 = 20;
/// Queue pairs a port may open.
pub const MAX_QUEUE_PAIRS: u32 = 16;

/// How packet buffers relate to the UMEM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// The engine owns a private UMEM; payloads are copied to and from application buffers.
    Copy,
    /// The application buffer pool is the UMEM; buffers go through the rings as they are.
    ZeroCopy,
}

impl fmt::Display for BufferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferMode::Copy => write!(f, "copy"),
            BufferMode::ZeroCopy => write!(f, "zero-copy"),
        }
    }
}

/// Busy-poll parameters applied to the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyPoll {
    pub timeout_us: u32,
    pub budget: u32,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct XskConfig {
    /// Buffer strategy. `None` picks zero-copy when the factory reports unaligned chunk
    /// support and copy otherwise.
    pub buffer_mode: Option<BufferMode>,
    /// Copy-mode chunk size, a power of two (default 4096).
    pub frame_size: Option<u32>,
    /// Copy-mode chunk count (default 4096).
    pub frame_count: Option<u32>,
    /// Copy-mode headroom in front of packet data (default 0).
    pub frame_headroom: Option<u32>,
    /// Entries of each of the four rings, a power of two (default 2048).
    pub ring_size: Option<u32>,
    /// Largest batch handled per ring pass (default: the ring size).
    pub max_batch: Option<u32>,
    /// Bind with `XDP_USE_NEED_WAKEUP` (default true).
    pub need_wakeup: Option<bool>,
    /// Driver mode: `Some(true)` binds with `XDP_ZEROCOPY`, `Some(false)` with `XDP_COPY`,
    /// `None` lets the kernel choose.
    pub zero_copy: Option<bool>,
    /// Back copy-mode UMEM with huge pages; `None` uses them when available.
    pub huge_page: Option<bool>,
    /// Reuse a UMEM already registered over the same buffer pool (zero-copy only).
    pub shared_umem: bool,
    /// `SO_BUSY_POLL_BUDGET`; `None` means the default of 64, `Some(0)` disables busy polling.
    pub busy_budget: Option<u32>,
    /// `SO_BUSY_POLL` in microseconds (default 20).
    pub busy_timeout_us: Option<u32>,
}

impl XskConfig {
    pub fn frame_size(&self) -> u32 {
        self.frame_size.unwrap_or(DEFAULT_FRAME_SIZE)
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count.unwrap_or(DEFAULT_FRAME_COUNT)
    }

    pub fn frame_headroom(&self) -> u32 {
        self.frame_headroom.unwrap_or(DEFAULT_FRAME_HEADROOM)
    }

    pub fn ring_size(&self) -> u32 {
        self.ring_size.unwrap_or(DEFAULT_RING_SIZE)
    }

    pub fn max_batch(&self) -> u32 {
        self.max_batch.unwrap_or_else(|| self.ring_size())
    }

    pub fn need_wakeup(&self) -> bool {
        self.need_wakeup.unwrap_or(true)
    }

    /// Busy-poll parameters, or `None` when disabled.
    pub fn busy_poll(&self) -> Option<BusyPoll> {
        match self.busy_budget.unwrap_or(DEFAULT_BUSY_BUDGET) {
            0 => None,
            budget => Some(BusyPoll {
                timeout_us: self.busy_timeout_us.unwrap_or(DEFAULT_BUSY_TIMEOUT_US),
                budget,
            }),
        }
    }

    pub fn validate(&self) -> io::Result<()> {
        let invalid = |msg: String| Err(io::Error::new(io::ErrorKind::InvalidInput, msg));
        let ring_size = self.ring_size();
        if ring_size == 0 || !ring_size.is_power_of_two() {
            return invalid(format!("ring size {ring_size} is not a power of two"));
        }
        let max_batch = self.max_batch();
        if max_batch == 0 || max_batch > ring_size {
            return invalid(format!(
                "max batch {max_batch} must be between 1 and the ring size {ring_size}"
            ));
        }
        let frame_size = self.frame_size();
        if !frame_size.is_power_of_two() {
            return invalid(format!("frame size {frame_size} is not a power of two"));
        }
        if self.frame_headroom() >= frame_size {
            return invalid(format!(
                "frame headroom {} does not fit in frame size {frame_size}",
                self.frame_headroom()
            ));
        }
        if self.frame_count() < ring_size {
            return invalid(format!(
                "{} frames cannot back rings of {ring_size} entries",
                self.frame_count()
            ));
        }
        if self.shared_umem && self.buffer_mode == Some(BufferMode::Copy) {
            return invalid("shared UMEM requires zero-copy buffer mode".to_string());
        }
        Ok(())
    }
}
