//! In-process stand-in for the kernel side of AF_XDP.
//!
//! `SimFactory` hands out queues whose rings live in anonymous memory; the opposite ends of
//! those rings go into a `SimKernel` the test drives by hand: it consumes Fill entries to
//! deliver packets, consumes TX descriptors and posts completions, and flips the
//! `NEED_WAKEUP` flags. `SimSocket` counts the syscalls the queue makes and can be told to
//! fail them.

use crate::addr::UmemAddress;
use crate::create::{BindFlags, Capabilities, QueueFactory, RingSizes, XskRings};
use crate::registry::QueueKey;
use crate::ring::{Ring, XdpDesc};
use crate::socket::{SocketOption, XdpStatistics, XskSocket};
use crate::umem::{UmemRegion, XDP_PACKET_HEADROOM};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

static NEXT_FD: AtomicI32 = AtomicI32::new(1000);

#[derive(Debug, Default)]
pub struct SimSocket {
    fd: RawFd,
    pub polls: AtomicU32,
    pub kicks: AtomicU32,
    pub probes: AtomicU32,
    kick_errno: Mutex<Option<i32>>,
    scripted_kick_errnos: Mutex<Vec<i32>>,
    fail_option: Option<SocketOption>,
    options: Mutex<Vec<(SocketOption, u32)>>,
    stats: Mutex<XdpStatistics>,
}

impl SimSocket {
    pub fn new(fail_option: Option<SocketOption>) -> Self {
        SimSocket {
            fd: NEXT_FD.fetch_add(1, Ordering::Relaxed),
            fail_option,
            ..Default::default()
        }
    }

    /// Every `send_kick` fails with `errno` until cleared.
    pub fn fail_kicks(&self, errno: Option<i32>) {
        *self.kick_errno.lock().unwrap() = errno;
    }

    /// The next `send_kick` calls fail with these errnos, in order.
    pub fn script_kicks(&self, errnos: &[i32]) {
        let mut script = self.scripted_kick_errnos.lock().unwrap();
        script.extend(errnos.iter().rev());
    }

    pub fn options(&self) -> Vec<(SocketOption, u32)> {
        self.options.lock().unwrap().clone()
    }

    pub fn set_rx_dropped(&self, n: u64) {
        self.stats.lock().unwrap().rx_dropped = n;
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn kicks(&self) -> u32 {
        self.kicks.load(Ordering::Relaxed)
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::Relaxed)
    }
}

impl XskSocket for SimSocket {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn poll_readable(&self, _timeout: Duration) -> io::Result<bool> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        Ok(false)
    }

    fn send_kick(&self) -> io::Result<()> {
        self.kicks.fetch_add(1, Ordering::Relaxed);
        if let Some(errno) = self.scripted_kick_errnos.lock().unwrap().pop() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        match *self.kick_errno.lock().unwrap() {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }

    fn recv_probe(&self) -> io::Result<()> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        Err(io::Error::from_raw_os_error(libc::EAGAIN))
    }

    fn set_option(&self, option: SocketOption, value: u32) -> io::Result<()> {
        if self.fail_option == Some(option) && value != 0 {
            return Err(io::Error::from_raw_os_error(libc::ENOPROTOOPT));
        }
        self.options.lock().unwrap().push((option, value));
        Ok(())
    }

    fn statistics(&self) -> io::Result<XdpStatistics> {
        Ok(*self.stats.lock().unwrap())
    }
}

/// The kernel ends of one queue's rings.
#[derive(Debug)]
pub struct SimKernel {
    pub key: QueueKey,
    pub flags: BindFlags,
    pub fill: Ring<u64>,
    pub completion: Ring<u64>,
    pub rx: Ring<XdpDesc>,
    pub tx: Ring<XdpDesc>,
    pub socket: Arc<SimSocket>,
    base: usize,
    len: usize,
    chunk_size: u64,
    frame_headroom: u32,
    unaligned: bool,
    release_fill: bool,
}

impl SimKernel {
    /// Takes one Fill entry per payload and posts the payloads on the RX ring, the way the
    /// kernel lays them out. Returns how many were delivered.
    pub fn deliver(&mut self, payloads: &[Vec<u8>]) -> usize {
        let (n, idx) = self.fill.peek(payloads.len() as u32);
        let rx_idx = self.rx.reserve(n).expect("RX ring overflow in test");
        for i in 0..n {
            let addr = self.fill.read(idx.wrapping_add(i));
            let offset = self.frame_headroom + XDP_PACKET_HEADROOM;
            let (data_pos, desc_addr) = if self.unaligned {
                (addr + offset as u64, UmemAddress::new(addr, offset).to_wire())
            } else {
                let pos = (addr & !(self.chunk_size - 1)) + offset as u64;
                (pos, pos)
            };
            let payload = &payloads[i as usize];
            self.bytes_mut(data_pos, payload.len())
                .copy_from_slice(payload);
            self.rx.write(
                rx_idx.wrapping_add(i),
                XdpDesc::new(desc_addr, payload.len() as u32, 0),
            );
        }
        if self.release_fill {
            self.fill.release(n);
        }
        self.rx.submit(n);
        n as usize
    }

    /// From now on Fill entries are used but never handed back, so the Fill ring fills up.
    pub fn stall_fill(&mut self) {
        self.release_fill = false;
    }

    /// Consumes up to `max` TX descriptors and posts their addresses as completions.
    pub fn complete_tx(&mut self, max: u32) -> Vec<XdpDesc> {
        let (n, idx) = self.tx.peek(max);
        let descs: Vec<XdpDesc> = (0..n).map(|i| self.tx.read(idx.wrapping_add(i))).collect();
        self.tx.release(n);
        let cq_idx = self.completion.reserve(n).expect("Completion ring overflow in test");
        for (i, desc) in descs.iter().enumerate() {
            self.completion.write(cq_idx.wrapping_add(i as u32), desc.addr);
        }
        self.completion.submit(n);
        descs
    }

    /// Consumes up to `max` TX descriptors without completing them.
    pub fn take_tx(&mut self, max: u32) -> Vec<XdpDesc> {
        let (n, idx) = self.tx.peek(max);
        let descs = (0..n).map(|i| self.tx.read(idx.wrapping_add(i))).collect();
        self.tx.release(n);
        descs
    }

    /// Posts completions for descriptors previously taken with `take_tx`.
    pub fn complete(&mut self, descs: &[XdpDesc]) {
        let n = descs.len() as u32;
        let idx = self.completion.reserve(n).expect("Completion ring overflow in test");
        for (i, desc) in descs.iter().enumerate() {
            self.completion.write(idx.wrapping_add(i as u32), desc.addr);
        }
        self.completion.submit(n);
    }

    /// The packet a TX or RX descriptor refers to.
    pub fn payload(&self, desc: &XdpDesc) -> Vec<u8> {
        self.bytes_mut(self.data_position(desc), desc.len as usize)
            .to_vec()
    }

    /// Address of the packet data of `desc` in process memory.
    pub fn data_ptr(&self, desc: &XdpDesc) -> *const u8 {
        (self.base + self.data_position(desc) as usize) as *const u8
    }

    fn data_position(&self, desc: &XdpDesc) -> u64 {
        if self.unaligned {
            UmemAddress::from_wire(desc.addr).data_position()
        } else {
            desc.addr
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn bytes_mut(&self, pos: u64, len: usize) -> &mut [u8] {
        assert!(pos as usize + len <= self.len, "access outside the UMEM");
        unsafe { std::slice::from_raw_parts_mut((self.base + pos as usize) as *mut u8, len) }
    }

    pub fn set_fill_need_wakeup(&self, on: bool) {
        self.fill.set_need_wakeup(on);
    }

    pub fn set_tx_need_wakeup(&self, on: bool) {
        self.tx.set_need_wakeup(on);
    }

    /// Entries the queue put on the Fill ring that the kernel has not taken.
    pub fn fill_pending(&self) -> u32 {
        self.fill.occupancy()
    }

    pub fn rx_pending(&self) -> u32 {
        self.rx.occupancy()
    }

    pub fn tx_pending(&self) -> u32 {
        self.tx.occupancy()
    }

    pub fn completion_pending(&self) -> u32 {
        self.completion.occupancy()
    }
}

#[derive(Default)]
pub struct SimFactory {
    pub caps: Capabilities,
    /// Socket option every created socket refuses.
    pub fail_option: Option<SocketOption>,
    pub registrations: AtomicU32,
    kernels: Mutex<Vec<SimKernel>>,
}

impl SimFactory {
    pub fn new() -> Self {
        SimFactory {
            caps: Capabilities {
                driver_zero_copy: false,
                unaligned_chunks: true,
            },
            ..Default::default()
        }
    }

    pub fn with_caps(caps: Capabilities) -> Self {
        SimFactory {
            caps,
            ..Default::default()
        }
    }

    pub fn failing_option(option: SocketOption) -> Self {
        SimFactory {
            fail_option: Some(option),
            ..SimFactory::new()
        }
    }

    /// Takes the kernel side of queue `key` out of the factory.
    pub fn kernel(&self, key: QueueKey) -> SimKernel {
        let mut kernels = self.kernels.lock().unwrap();
        let pos = kernels
            .iter()
            .position(|k| k.key == key)
            .expect("no such queue");
        kernels.remove(pos)
    }

    pub fn registrations(&self) -> u32 {
        self.registrations.load(Ordering::Relaxed)
    }
}

impl QueueFactory for SimFactory {
    fn capabilities(&self, _if_index: u32) -> io::Result<Capabilities> {
        Ok(self.caps)
    }

    fn create(
        &self,
        umem: &UmemRegion,
        key: QueueKey,
        sizes: &RingSizes,
        flags: BindFlags,
    ) -> io::Result<XskRings> {
        if umem.owner().is_none() {
            self.registrations.fetch_add(1, Ordering::Relaxed);
        }
        let fill = Ring::<u64>::anonymous(sizes.fill)?;
        let completion = Ring::<u64>::anonymous(sizes.completion)?;
        let rx = Ring::<XdpDesc>::anonymous(sizes.rx)?;
        let tx = Ring::<XdpDesc>::anonymous(sizes.tx)?;
        let socket = Arc::new(SimSocket::new(self.fail_option));
        self.kernels.lock().unwrap().push(SimKernel {
            key,
            flags,
            fill: fill.peer(),
            completion: completion.peer(),
            rx: rx.peer(),
            tx: tx.peer(),
            socket: socket.clone(),
            base: umem.base_address() as usize,
            len: umem.len(),
            chunk_size: umem.chunk_size() as u64,
            frame_headroom: umem.frame_headroom(),
            unaligned: umem.is_unaligned(),
            release_fill: true,
        });
        Ok(XskRings {
            fill,
            completion,
            rx,
            tx,
            socket,
        })
    }
}

/// Lets a port own the factory while the test keeps reaching the kernels.
impl QueueFactory for Arc<SimFactory> {
    fn capabilities(&self, if_index: u32) -> io::Result<Capabilities> {
        (**self).capabilities(if_index)
    }

    fn create(
        &self,
        umem: &UmemRegion,
        key: QueueKey,
        sizes: &RingSizes,
        flags: BindFlags,
    ) -> io::Result<XskRings> {
        (**self).create(umem, key, sizes, flags)
    }
}
