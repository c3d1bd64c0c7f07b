//! # Queue Pairs
//!
//! ## Purpose
//!
//! An [`XskQueue`] is one RX/TX queue pair bound to one NIC queue: the socket, its four rings,
//! the UMEM they address and the buffer strategy moving packets between the rings and
//! application mbufs. It is the unit the application polls with [`XskQueue::rx_burst`] and
//! [`XskQueue::tx_burst`].
//!
//! ## How it works
//!
//! Setup validates the configuration, resolves the buffer mode from the factory capabilities,
//! finds or creates the UMEM through the registry, creates the bound socket, configures the
//! wakeup policy and stocks half of the Fill ring.
//!
//! Bursts larger than `max_batch` are cut into `max_batch` pieces handed to the engine one
//! after the other; the first piece that is not fully served ends the burst. On TX every frame
//! handed in is consumed: sent, or freed and counted as dropped.
//!
//! ## Main components
//!
//! - `XskQueue`: setup, bursts, statistics.
//! - `RxQueue`, `TxQueue`: the ring halves and their counters.
//! - `QueueSetup`: everything setup needs.

use crate::config::{BufferMode, XskConfig};
use crate::create::{BindFlags, Capabilities, QueueFactory, RingSizes};
use crate::engine::{self, RxTxEngine};
use crate::kick::TxKick;
use crate::mempool::{MBUF_HEADROOM, Mbuf, Mempool};
use crate::registry::{QueueKey, Registration, UmemRegistry};
use crate::ring::{Ring, XdpDesc};
use crate::socket::XskSocket;
use crate::stats::{QueueStats, RxStats, TxStats};
use crate::umem::{UmemRegion, XDP_PACKET_HEADROOM};
use crate::wakeup::{WakeupMode, WakeupPolicy};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

/// RX ring, Fill ring and receive counters.
#[derive(Debug)]
pub struct RxQueue {
    pub(crate) ring: Ring<XdpDesc>,
    pub(crate) fill: Ring<u64>,
    pub(crate) stats: RxStats,
}

/// TX ring, Completion ring and transmit counters.
#[derive(Debug)]
pub struct TxQueue {
    pub(crate) ring: Ring<XdpDesc>,
    pub(crate) completion: Ring<u64>,
    pub(crate) kick: TxKick,
    pub(crate) stats: TxStats,
}

/// Inputs of [`XskQueue::setup`].
pub struct QueueSetup<'a> {
    pub factory: &'a dyn QueueFactory,
    pub registry: &'a Arc<UmemRegistry>,
    /// Buffers received packets are delivered in; the UMEM itself in zero-copy mode.
    pub pool: &'a Arc<Mempool>,
    pub key: QueueKey,
    pub config: XskConfig,
}

pub struct XskQueue {
    key: QueueKey,
    rx: RxQueue,
    tx: TxQueue,
    engine: Box<dyn RxTxEngine>,
    wakeup: WakeupPolicy,
    socket: Arc<dyn XskSocket>,
    max_batch: u32,
    missed_base: u64,
    batch: Vec<Mbuf>,
    _registration: Registration,
    umem: Arc<UmemRegion>,
}

impl std::fmt::Debug for XskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XskQueue")
            .field("key", &self.key)
            .field("mode", &self.engine.mode())
            .field("wakeup", &self.wakeup)
            .field("max_batch", &self.max_batch)
            .field("umem", &self.umem)
            .finish()
    }
}

fn resolve_mode(config: &XskConfig, caps: &Capabilities) -> io::Result<BufferMode> {
    let mode = match config.buffer_mode {
        Some(mode) => mode,
        None if caps.unaligned_chunks => BufferMode::ZeroCopy,
        None => BufferMode::Copy,
    };
    if mode == BufferMode::ZeroCopy && !caps.unaligned_chunks {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "zero-copy buffers need unaligned UMEM chunks",
        ));
    }
    if config.shared_umem && mode == BufferMode::Copy {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "shared UMEM requires zero-copy buffer mode",
        ));
    }
    Ok(mode)
}

/// In copy mode every received packet is copied into one mbuf.
fn check_rx_room(config: &XskConfig, pool: &Mempool) -> io::Result<()> {
    let data_size = config.frame_size() - config.frame_headroom() - XDP_PACKET_HEADROOM;
    let buf_size = pool.data_room().saturating_sub(MBUF_HEADROOM) as u32;
    if data_size > buf_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "{data_size} bytes will not fit in mbufs of {} ({buf_size} bytes)",
                pool.name()
            ),
        ));
    }
    Ok(())
}

impl XskQueue {
    pub fn setup(setup: QueueSetup<'_>) -> io::Result<Self> {
        let QueueSetup {
            factory,
            registry,
            pool,
            key,
            config,
        } = setup;
        config.validate()?;
        let caps = factory.capabilities(key.if_index)?;
        let mode = resolve_mode(&config, &caps)?;
        if mode == BufferMode::Copy {
            check_rx_room(&config, pool)?;
        }

        let shared_pool = (config.shared_umem && mode == BufferMode::ZeroCopy).then(|| pool.id());
        let (umem, registration) = registry.attach(key, shared_pool, || match mode {
            BufferMode::Copy => UmemRegion::allocate(
                config.frame_size(),
                config.frame_count(),
                config.frame_headroom(),
                config.huge_page,
            ),
            BufferMode::ZeroCopy => UmemRegion::overlay(pool),
        })?;

        // The kernel rejects mode flags on sockets joining an existing UMEM.
        let flags = if umem.owner().is_some() {
            BindFlags::SHARED_UMEM
        } else {
            let mut flags = BindFlags::empty();
            if config.need_wakeup() {
                flags |= BindFlags::USE_NEED_WAKEUP;
            }
            match config.zero_copy {
                Some(true) => flags |= BindFlags::ZEROCOPY,
                Some(false) => flags |= BindFlags::COPY,
                None if caps.driver_zero_copy => flags |= BindFlags::ZEROCOPY,
                None => {}
            }
            flags
        };

        let rings = factory.create(&umem, key, &RingSizes::uniform(config.ring_size()), flags)?;
        let socket = rings.socket;
        if !flags.contains(BindFlags::SHARED_UMEM) && !umem.set_owner(socket.clone()) {
            log::debug!("{key}: UMEM was registered concurrently by another queue");
        }

        let wakeup = WakeupPolicy::configure(socket.clone(), config.busy_poll());
        let max_batch = config.max_batch();
        let mut engine = engine::build(&umem, pool);
        let mut rx = RxQueue {
            ring: rings.rx,
            fill: rings.fill,
            stats: RxStats::default(),
        };
        let tx = TxQueue {
            kick: TxKick::new(socket.clone(), rings.completion.capacity(), max_batch),
            ring: rings.tx,
            completion: rings.completion,
            stats: TxStats::default(),
        };

        let wanted = rx.fill.capacity() / 2;
        let stocked = engine.stock_fill(&umem, &mut rx.fill, wanted);
        if stocked == 0 {
            return Err(io::Error::other(format!(
                "{key}: Failed to stock the Fill ring with {wanted} buffers"
            )));
        }
        if stocked < wanted {
            log::warn!("{key}: Fill ring stocked with {stocked} of {wanted} buffers");
        }

        log::info!(
            "{key}: {mode} mode, {} ring entries, batch {max_batch}, {:?}, UMEM users {}",
            config.ring_size(),
            wakeup.mode(),
            umem.refcount()
        );

        Ok(XskQueue {
            key,
            rx,
            tx,
            engine,
            wakeup,
            socket,
            max_batch,
            missed_base: 0,
            batch: Vec::with_capacity(max_batch as usize),
            _registration: registration,
            umem,
        })
    }

    /// Receives up to `max` packets, appending them to `out`. Returns how many were appended.
    pub fn rx_burst(&mut self, out: &mut Vec<Mbuf>, max: usize) -> usize {
        let mut total = 0;
        while total < max {
            let n = (max - total).min(self.max_batch as usize) as u32;
            let got = self
                .engine
                .receive(&self.umem, &mut self.rx, &self.wakeup, out, n);
            total += got as usize;
            if got < n {
                break;
            }
        }
        total
    }

    /// Transmits the frames in `frames`, which is left empty. Returns how many were sent;
    /// the rest were freed and counted as dropped.
    pub fn tx_burst(&mut self, frames: &mut Vec<Mbuf>) -> usize {
        let mut sent = 0;
        let mut pending = frames.drain(..);
        loop {
            self.batch
                .extend(pending.by_ref().take(self.max_batch as usize));
            if self.batch.is_empty() {
                break;
            }
            sent += self
                .engine
                .transmit(&self.umem, &mut self.tx, &mut self.batch) as usize;
            if !self.batch.is_empty() {
                break;
            }
        }
        let dropped = self.batch.len() + pending.len();
        if dropped > 0 {
            log::debug!("{}: {dropped} frames not sent", self.key);
            self.tx.stats.dropped += dropped as u64;
            self.batch.clear();
        }
        sent
    }

    /// Frees the buffers of all completed transmissions.
    pub fn reclaim(&mut self) -> usize {
        let n = self.tx.completion.capacity();
        self.engine
            .reclaim(&self.umem, &mut self.tx.completion, n) as usize
    }

    pub fn stats(&self) -> io::Result<QueueStats> {
        let kernel = self.socket.statistics()?;
        Ok(QueueStats::new(
            &self.rx.stats,
            &self.tx.stats,
            kernel,
            self.missed_base,
        ))
    }

    /// Zeroes the counters; kernel drops are counted from now on.
    pub fn reset_stats(&mut self) -> io::Result<()> {
        self.missed_base = self.socket.statistics()?.rx_dropped;
        self.rx.stats = RxStats::default();
        self.tx.stats = TxStats::default();
        Ok(())
    }

    pub fn key(&self) -> QueueKey {
        self.key
    }

    pub fn mode(&self) -> BufferMode {
        self.engine.mode()
    }

    pub fn wakeup_mode(&self) -> WakeupMode {
        self.wakeup.mode()
    }

    /// `SO_BUSY_POLL_BUDGET` in effect, 0 without busy polling.
    pub fn busy_budget(&self) -> u32 {
        self.wakeup.busy_budget()
    }

    pub fn max_batch(&self) -> u32 {
        self.max_batch
    }

    pub fn umem(&self) -> &Arc<UmemRegion> {
        &self.umem
    }

    /// Socket descriptor, for XSK map insertion or readiness polling.
    pub fn raw_fd(&self) -> RawFd {
        self.socket.raw_fd()
    }
}

impl Drop for XskQueue {
    fn drop(&mut self) {
        self.reclaim();
        self.engine.close(&self.umem);
        log::debug!(
            "{}: queue closed, UMEM users left {}",
            self.key,
            self.umem.refcount() - 1
        );
    }
}
