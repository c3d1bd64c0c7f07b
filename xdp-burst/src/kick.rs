//! # TX Kick
//!
//! ## Purpose
//!
//! With `XDP_USE_NEED_WAKEUP` the kernel only transmits what sits in the TX ring after a
//! zero-length `sendto`. This file issues that syscall.
//!
//! ## How it works
//!
//! Completions are drained first so the kernel has room to post new ones. If the TX ring flags
//! `NEED_WAKEUP`, a non-blocking send is attempted. `EBUSY`, `EAGAIN` and `EINTR` mean "try
//! again" (after another drain on `EAGAIN`); any other error ends the attempt. The number of
//! attempts is bounded so a wedged device cannot pin the caller.

use crate::ring::{Ring, XdpDesc};
use crate::socket::XskSocket;
use std::fmt;
use std::sync::Arc;

pub struct TxKick {
    socket: Arc<dyn XskSocket>,
    max_attempts: u32,
}

impl fmt::Debug for TxKick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxKick")
            .field("fd", &self.socket.raw_fd())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl TxKick {
    /// A kick for a queue with `completion_size` Completion entries drained `max_batch` at a
    /// time: `completion_size / max_batch + 1` send attempts at most.
    pub fn new(socket: Arc<dyn XskSocket>, completion_size: u32, max_batch: u32) -> Self {
        TxKick {
            socket,
            max_attempts: completion_size / max_batch.max(1) + 1,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Drains completions with `reclaim`, then wakes the kernel if `tx` asks for it.
    /// Returns the number of `sendto` calls made.
    pub fn kick(&self, tx: &Ring<XdpDesc>, mut reclaim: impl FnMut()) -> u32 {
        reclaim();
        if !tx.needs_wakeup() {
            return 0;
        }
        for attempt in 1..=self.max_attempts {
            let Err(e) = self.socket.send_kick() else {
                return attempt;
            };
            match e.raw_os_error() {
                Some(libc::EAGAIN) => reclaim(),
                Some(libc::EBUSY | libc::EINTR) => {}
                Some(libc::ENETDOWN) => {
                    log::warn!("network interface is down, cannot wake up");
                    return attempt;
                }
                _ => {
                    log::error!("socket {}: TX wakeup failed: {e}", self.socket.raw_fd());
                    return attempt;
                }
            }
        }
        log::debug!(
            "socket {}: TX wakeup gave up after {} attempts",
            self.socket.raw_fd(),
            self.max_attempts
        );
        self.max_attempts
    }
}
