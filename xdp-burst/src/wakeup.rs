//! # RX Wakeup Policy
//!
//! ## Purpose
//!
//! With `XDP_USE_NEED_WAKEUP` the kernel only processes the Fill ring when told to, and with
//! busy polling it only processes RX when the application asks. This file decides which
//! syscall an idle RX burst issues.
//!
//! ## How it works
//!
//! - `Plain`: nothing received and the Fill ring flags `NEED_WAKEUP` → `poll(POLLIN)` with a
//!   one second timeout; otherwise no syscall at all.
//! - `BusyPoll`: nothing received → non-blocking zero-length `recvfrom`, unconditionally.
//!
//! Busy polling is configured with three socket options. If any of them fails, the ones
//! already applied are reset and the queue stays in `Plain` mode.

use crate::config::BusyPoll;
use crate::ring::Ring;
use crate::socket::{SocketOption, XskSocket};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// How long an idle RX burst waits in `Plain` mode.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupMode {
    Plain,
    BusyPoll(BusyPoll),
}

pub struct WakeupPolicy {
    mode: WakeupMode,
    socket: Arc<dyn XskSocket>,
}

impl fmt::Debug for WakeupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeupPolicy")
            .field("mode", &self.mode)
            .field("fd", &self.socket.raw_fd())
            .finish()
    }
}

impl WakeupPolicy {
    /// Applies `busy_poll` to `socket` if requested, falling back to `Plain` on failure.
    pub fn configure(socket: Arc<dyn XskSocket>, busy_poll: Option<BusyPoll>) -> Self {
        let mode = match busy_poll {
            None => WakeupMode::Plain,
            Some(cfg) => match enable_busy_poll(socket.as_ref(), cfg) {
                Ok(()) => {
                    log::info!(
                        "socket {}: busy polling with budget {} and timeout {}us",
                        socket.raw_fd(),
                        cfg.budget,
                        cfg.timeout_us
                    );
                    WakeupMode::BusyPoll(cfg)
                }
                Err(e) => {
                    log::warn!(
                        "socket {}: busy polling unavailable, using plain wakeups: {e}",
                        socket.raw_fd()
                    );
                    WakeupMode::Plain
                }
            },
        };
        WakeupPolicy { mode, socket }
    }

    pub fn mode(&self) -> WakeupMode {
        self.mode
    }

    /// `SO_BUSY_POLL_BUDGET` in effect; 0 in `Plain` mode.
    pub fn busy_budget(&self) -> u32 {
        match self.mode {
            WakeupMode::Plain => 0,
            WakeupMode::BusyPoll(cfg) => cfg.budget,
        }
    }

    /// Called when an RX burst found nothing.
    pub fn rx_idle(&self, fill: &Ring<u64>) {
        let res = match self.mode {
            WakeupMode::BusyPoll(_) => self.socket.recv_probe(),
            WakeupMode::Plain if fill.needs_wakeup() => {
                self.socket.poll_readable(POLL_TIMEOUT).map(|_| ())
            }
            WakeupMode::Plain => return,
        };
        if let Err(e) = res {
            match e.raw_os_error() {
                Some(libc::EAGAIN | libc::EBUSY | libc::EINTR) => {}
                Some(libc::ENETDOWN) => log::warn!("network interface is down, cannot wake up"),
                _ => log::debug!("socket {}: RX wakeup failed: {e}", self.socket.raw_fd()),
            }
        }
    }
}

fn enable_busy_poll(socket: &dyn XskSocket, cfg: BusyPoll) -> io::Result<()> {
    let steps = [
        (SocketOption::PreferBusyPoll, 1),
        (SocketOption::BusyPoll, cfg.timeout_us),
        (SocketOption::BusyPollBudget, cfg.budget),
    ];
    for (i, &(option, value)) in steps.iter().enumerate() {
        if let Err(e) = socket.set_option(option, value) {
            for &(applied, _) in steps[..i].iter().rev() {
                if let Err(e) = socket.set_option(applied, 0) {
                    log::error!("Failed to reset {applied:?}: {e}");
                }
            }
            return Err(io::Error::other(format!("Failed to set {option:?}: {e}")));
        }
    }
    Ok(())
}
