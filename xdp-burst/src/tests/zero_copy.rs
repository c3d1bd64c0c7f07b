use super::sim::SimFactory;
use super::*;
use crate::addr::UmemAddress;

/// Offset of packet data in a received buffer: pool header, mbuf metadata, mbuf headroom and
/// the kernel's XDP headroom.
const RX_DATA_OFFSET: u64 = 64 + 128 + 128 + 256;

fn data_offset(pool: &Mempool, mbuf: &Mbuf) -> u64 {
    mbuf.data().as_ptr() as u64 - pool.base_address() as u64 - pool.element_offset(mbuf.index())
}

#[test]
fn received_packets_are_not_copied() -> anyhow::Result<()> {
    init_logger();
    let factory = SimFactory::new();
    let registry = UmemRegistry::new();
    let app = pool("zc-rx", 4096);
    let (mut queue, mut kernel) = open(&factory, &registry, &app, 0, zero_copy_config())?;
    assert_eq!(queue.mode(), BufferMode::ZeroCopy);
    assert_eq!(queue.umem().frame_headroom(), 320);
    assert_eq!(app.in_use(), 1024);

    kernel.deliver(&udp_frames(0..5));
    let mut out = Vec::new();
    assert_eq!(queue.rx_burst(&mut out, 64), 5);
    assert_eq!(seqs(&out), vec![0, 1, 2, 3, 4]);
    for mbuf in &out {
        assert_eq!(mbuf.pool_id(), app.id());
        assert_eq!(mbuf.headroom(), 384);
        assert_eq!(data_offset(&app, mbuf), RX_DATA_OFFSET);
    }
    assert_eq!(kernel.fill_pending(), 1024);
    assert_eq!(app.in_use(), 1024 + 5);

    drop(out);
    assert_eq!(app.in_use(), 1024);
    Ok(())
}

#[test]
fn pool_buffers_are_sent_in_place() -> anyhow::Result<()> {
    init_logger();
    let factory = SimFactory::new();
    let registry = UmemRegistry::new();
    let app = pool("zc-tx", 4096);
    let (mut queue, mut kernel) = open(&factory, &registry, &app, 0, zero_copy_config())?;

    let mut frames = mbufs(&app, &udp_frames(0..8));
    let ptrs: Vec<*const u8> = frames.iter().map(|m| m.data().as_ptr()).collect();
    let bases: Vec<u64> = frames.iter().map(|m| app.element_offset(m.index())).collect();
    assert_eq!(queue.tx_burst(&mut frames), 8);
    assert_eq!(app.in_use(), 1024 + 8);

    let sent = kernel.take_tx(64);
    assert_eq!(sent.len(), 8);
    for (i, desc) in sent.iter().enumerate() {
        let addr = UmemAddress::from_wire(desc.addr);
        assert_eq!(addr.base, bases[i]);
        assert_eq!(addr.offset, 64 + 128 + 128);
        assert_eq!(kernel.data_ptr(desc), ptrs[i]);
        assert_eq!(frame_seq(&kernel.payload(desc)), i as u16);
    }

    kernel.complete(&sent);
    assert_eq!(queue.reclaim(), 8);
    assert_eq!(app.in_use(), 1024);
    Ok(())
}

#[test]
fn foreign_buffers_are_copied() -> anyhow::Result<()> {
    init_logger();
    let factory = SimFactory::new();
    let registry = UmemRegistry::new();
    let app = pool("zc-local", 4096);
    let foreign = pool("zc-foreign", 64);
    let (mut queue, mut kernel) = open(&factory, &registry, &app, 0, zero_copy_config())?;

    let mut frames = mbufs(&foreign, &udp_frames(0..16));
    assert_eq!(queue.tx_burst(&mut frames), 16);
    assert_eq!(foreign.in_use(), 0);
    assert_eq!(app.in_use(), 1024 + 16);

    let sent = kernel.complete_tx(64);
    let got: Vec<u16> = sent.iter().map(|d| frame_seq(&kernel.payload(d))).collect();
    assert_eq!(got, (0..16).collect::<Vec<_>>());
    assert_eq!(queue.reclaim(), 16);
    assert_eq!(app.in_use(), 1024);
    Ok(())
}

#[test]
fn received_frames_can_be_forwarded() -> anyhow::Result<()> {
    init_logger();
    let factory = SimFactory::new();
    let registry = UmemRegistry::new();
    let app = pool("zc-fwd", 4096);
    let (mut queue, mut kernel) = open(&factory, &registry, &app, 0, zero_copy_config())?;

    kernel.deliver(&udp_frames(0..32));
    let mut frames = Vec::new();
    assert_eq!(queue.rx_burst(&mut frames, 64), 32);
    assert_eq!(queue.tx_burst(&mut frames), 32);

    let sent = kernel.complete_tx(64);
    for (i, desc) in sent.iter().enumerate() {
        assert_eq!(UmemAddress::from_wire(desc.addr).offset as u64, RX_DATA_OFFSET);
        assert_eq!(frame_seq(&kernel.payload(desc)), i as u16);
    }
    assert_eq!(queue.reclaim(), 32);
    assert_eq!(app.in_use(), 1024);
    Ok(())
}

#[test]
fn full_tx_ring_returns_buffers_to_the_pool() -> anyhow::Result<()> {
    init_logger();
    let factory = SimFactory::new();
    let registry = UmemRegistry::new();
    let app = pool("zc-full", 256);
    let foreign = pool("zc-full-foreign", 16);
    let config = XskConfig {
        ring_size: Some(64),
        ..zero_copy_config()
    };
    let (mut queue, mut kernel) = open(&factory, &registry, &app, 0, config)?;
    assert_eq!(app.in_use(), 32);

    let mut frames = mbufs(&app, &udp_frames(0..64));
    assert_eq!(queue.tx_burst(&mut frames), 64);

    kernel.set_tx_need_wakeup(true);
    let mut frames = mbufs(&app, &udp_frames(64..70));
    frames.extend(mbufs(&foreign, &udp_frames(70..74)));
    assert_eq!(queue.tx_burst(&mut frames), 0);
    assert_eq!(queue.stats()?.tx_dropped, 10);
    assert_eq!(foreign.in_use(), 0);
    assert_eq!(app.in_use(), 32 + 64);
    assert!(kernel.socket.kicks() >= 1);

    let sent = kernel.complete_tx(64);
    assert_eq!(sent.len(), 64);
    assert_eq!(queue.reclaim(), 64);
    assert_eq!(app.in_use(), 32);
    Ok(())
}

#[test]
fn closed_queues_give_their_buffers_back() -> anyhow::Result<()> {
    init_logger();
    let factory = SimFactory::new();
    let registry = UmemRegistry::new();
    let app = pool("zc-reopen", 4096);

    for round in 0..6u16 {
        let (mut queue, mut kernel) = open(&factory, &registry, &app, 0, zero_copy_config())?;
        assert_eq!(app.in_use(), 1024, "round {round}");

        kernel.deliver(&udp_frames(0..16));
        let mut out = Vec::new();
        assert_eq!(queue.rx_burst(&mut out, 64), 16);
        assert_eq!(queue.tx_burst(&mut out), 16);

        // Half the frames are completed before the close, half are still on the TX ring.
        let sent = kernel.take_tx(8);
        kernel.complete(&sent);
        assert_eq!(app.in_use(), 1024 + 16);

        drop(queue);
        assert_eq!(app.in_use(), 0, "round {round}");
        assert!(registry.is_empty());
    }
    Ok(())
}

#[test]
fn replaced_port_queues_give_their_buffers_back() -> anyhow::Result<()> {
    init_logger();
    let factory = Arc::new(SimFactory::new());
    let app = pool("zc-replace", 4096);
    let mut port = crate::port::XskPort::with_factory(
        IF_INDEX,
        zero_copy_config(),
        Box::new(factory.clone()),
        UmemRegistry::new(),
    )?;

    for _ in 0..6 {
        port.setup_queue(0, &app)?;
        assert_eq!(app.in_use(), 1024);
        let mut kernel = factory.kernel(QueueKey::new(IF_INDEX, 0));
        kernel.deliver(&udp_frames(0..8));
        let mut out = Vec::new();
        assert_eq!(port.queue_mut(0).unwrap().rx_burst(&mut out, 64), 8);
    }
    drop(port.release_queue(0));
    assert_eq!(app.in_use(), 0);
    assert_eq!(factory.registrations(), 6);
    Ok(())
}

#[test]
fn full_fill_ring_returns_replacements_to_the_pool() -> anyhow::Result<()> {
    init_logger();
    let factory = SimFactory::new();
    let registry = UmemRegistry::new();
    let app = pool("zc-fill-full", 256);
    let config = XskConfig {
        ring_size: Some(64),
        ..zero_copy_config()
    };
    let (mut queue, mut kernel) = open(&factory, &registry, &app, 0, config)?;
    assert_eq!(kernel.fill_pending(), 32);
    kernel.stall_fill();

    let mut out = Vec::new();
    kernel.deliver(&udp_frames(0..32));
    assert_eq!(queue.rx_burst(&mut out, 64), 32);
    assert_eq!(kernel.fill_pending(), 64);
    assert_eq!(app.in_use(), 64);

    // No Fill room for the replacements of these.
    kernel.deliver(&udp_frames(32..42));
    assert_eq!(queue.rx_burst(&mut out, 64), 10);
    assert_eq!(seqs(&out), (0..42).collect::<Vec<_>>());
    assert_eq!(kernel.fill_pending(), 64);
    assert_eq!(app.in_use(), 64);

    drop(queue);
    assert_eq!(app.in_use(), 42);
    drop(out);
    assert_eq!(app.in_use(), 0);
    Ok(())
}
