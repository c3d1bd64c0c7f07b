#![cfg(test)]

mod sim;

mod ring;
mod shared;
mod zero_copy;

use crate::config::{BufferMode, XskConfig};
use crate::mempool::{DEFAULT_DATA_ROOM, Mbuf, Mempool};
use crate::queue::{QueueSetup, XskQueue};
use crate::registry::{QueueKey, UmemRegistry};
use sim::{SimFactory, SimKernel};
use std::sync::Arc;

pub const IF_INDEX: u32 = 7;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Copy mode with 2048 byte chunks so a chunk fits a default mbuf, plain wakeups.
pub fn copy_config() -> XskConfig {
    XskConfig {
        buffer_mode: Some(BufferMode::Copy),
        frame_size: Some(2048),
        busy_budget: Some(0),
        ..Default::default()
    }
}

pub fn zero_copy_config() -> XskConfig {
    XskConfig {
        buffer_mode: Some(BufferMode::ZeroCopy),
        busy_budget: Some(0),
        ..Default::default()
    }
}

pub fn pool(name: &str, capacity: u32) -> Arc<Mempool> {
    Mempool::new(name, capacity, DEFAULT_DATA_ROOM).unwrap()
}

/// A UDP frame whose source port carries `seq`.
pub fn udp_frame(seq: u16) -> Vec<u8> {
    let builder = etherparse::PacketBuilder::ethernet2(
        [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
        [0x02, 0x00, 0x00, 0x00, 0x00, 0x02],
    )
    .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
    .udp(seq, 9000);
    let payload = [0xa5u8; 18];
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, &payload).unwrap();
    frame
}

pub fn udp_frames(range: std::ops::Range<u16>) -> Vec<Vec<u8>> {
    range.map(udp_frame).collect()
}

/// The sequence number `udp_frame` put into `frame`.
pub fn frame_seq(frame: &[u8]) -> u16 {
    match etherparse::SlicedPacket::from_ethernet(frame) {
        Ok(packet) => match packet.transport {
            Some(etherparse::TransportSlice::Udp(udp)) => udp.source_port(),
            _ => panic!("Not udp packet"),
        },
        Err(e) => panic!("Failed to parse packet: {}", e),
    }
}

pub fn seqs(bufs: &[Mbuf]) -> Vec<u16> {
    bufs.iter().map(|m| frame_seq(m.data())).collect()
}

/// Mbufs from `pool` holding `frames`.
pub fn mbufs(pool: &Arc<Mempool>, frames: &[Vec<u8>]) -> Vec<Mbuf> {
    frames
        .iter()
        .map(|frame| {
            let mut mbuf = pool.alloc().unwrap();
            assert!(mbuf.extend_from_slice(frame));
            mbuf
        })
        .collect()
}

pub fn open(
    factory: &SimFactory,
    registry: &Arc<UmemRegistry>,
    pool: &Arc<Mempool>,
    queue_index: u32,
    config: XskConfig,
) -> anyhow::Result<(XskQueue, SimKernel)> {
    let key = QueueKey::new(IF_INDEX, queue_index);
    let queue = XskQueue::setup(QueueSetup {
        factory,
        registry,
        pool,
        key,
        config,
    })?;
    Ok((queue, factory.kernel(key)))
}
