use super::sim::SimFactory;
use super::*;
use crate::create::BindFlags;

fn shared_config() -> XskConfig {
    XskConfig {
        shared_umem: true,
        ..zero_copy_config()
    }
}

#[test]
fn second_queue_joins_the_region() -> anyhow::Result<()> {
    init_logger();
    let factory = SimFactory::new();
    let registry = UmemRegistry::new();
    let app = pool("shared", 8192);

    let (q0, k0) = open(&factory, &registry, &app, 0, shared_config())?;
    assert_eq!(q0.umem().refcount(), 1);
    assert_eq!(q0.umem().max_sharers(), 2);
    assert!(k0.flags.contains(BindFlags::USE_NEED_WAKEUP));
    assert!(!k0.flags.contains(BindFlags::SHARED_UMEM));

    let (q1, k1) = open(&factory, &registry, &app, 1, shared_config())?;
    assert!(Arc::ptr_eq(q0.umem(), q1.umem()));
    assert_eq!(q1.umem().refcount(), 2);
    assert_eq!(k1.flags, BindFlags::SHARED_UMEM);
    assert_eq!(factory.registrations(), 1);
    assert_eq!(registry.len(), 2);
    assert_eq!(
        q1.umem().owner().map(|s| s.raw_fd()),
        Some(q0.raw_fd())
    );

    let region = Arc::downgrade(q0.umem());
    drop(q0);
    assert_eq!(q1.umem().refcount(), 1);
    assert_eq!(registry.len(), 1);
    drop(q1);
    assert!(region.upgrade().is_none());
    assert!(registry.is_empty());
    Ok(())
}

#[test]
fn full_region_is_not_shared() -> anyhow::Result<()> {
    init_logger();
    let factory = SimFactory::new();
    let registry = UmemRegistry::new();
    let app = pool("shared-full", 8192);

    let (q0, _k0) = open(&factory, &registry, &app, 0, shared_config())?;
    let (q1, _k1) = open(&factory, &registry, &app, 1, shared_config())?;
    let (q2, k2) = open(&factory, &registry, &app, 2, shared_config())?;
    assert!(Arc::ptr_eq(q0.umem(), q1.umem()));
    assert!(!Arc::ptr_eq(q0.umem(), q2.umem()));
    assert!(!k2.flags.contains(BindFlags::SHARED_UMEM));
    assert_eq!(factory.registrations(), 2);

    // A freed seat is reused.
    drop(q1);
    let (q3, k3) = open(&factory, &registry, &app, 3, shared_config())?;
    assert_eq!(k3.flags, BindFlags::SHARED_UMEM);
    assert!(Arc::ptr_eq(q0.umem(), q3.umem()));
    assert_eq!(q3.umem().refcount(), 2);
    assert_eq!(q2.umem().refcount(), 1);
    Ok(())
}

#[test]
fn unshared_queues_get_their_own_region() -> anyhow::Result<()> {
    init_logger();
    let factory = SimFactory::new();
    let registry = UmemRegistry::new();
    let app = pool("unshared", 8192);

    let (q0, _k0) = open(&factory, &registry, &app, 0, zero_copy_config())?;
    let (q1, k1) = open(&factory, &registry, &app, 1, zero_copy_config())?;
    assert!(!Arc::ptr_eq(q0.umem(), q1.umem()));
    assert!(!k1.flags.contains(BindFlags::SHARED_UMEM));
    assert_eq!(factory.registrations(), 2);
    Ok(())
}

#[test]
fn shared_queues_receive_independently() -> anyhow::Result<()> {
    init_logger();
    let factory = SimFactory::new();
    let registry = UmemRegistry::new();
    let app = pool("shared-rx", 8192);

    let (mut q0, mut k0) = open(&factory, &registry, &app, 0, shared_config())?;
    let (mut q1, mut k1) = open(&factory, &registry, &app, 1, shared_config())?;
    assert_eq!(app.in_use(), 2048);

    k0.deliver(&udp_frames(0..10));
    k1.deliver(&udp_frames(100..120));
    let mut out0 = Vec::new();
    let mut out1 = Vec::new();
    assert_eq!(q0.rx_burst(&mut out0, 64), 10);
    assert_eq!(q1.rx_burst(&mut out1, 64), 20);
    assert_eq!(seqs(&out0), (0..10).collect::<Vec<_>>());
    assert_eq!(seqs(&out1), (100..120).collect::<Vec<_>>());
    assert_eq!(app.in_use(), 2048 + 30);
    Ok(())
}

#[test]
fn kernel_buffers_return_with_the_last_sharer() -> anyhow::Result<()> {
    init_logger();
    let factory = SimFactory::new();
    let registry = UmemRegistry::new();
    let app = pool("shared-close", 8192);

    let (mut q0, mut k0) = open(&factory, &registry, &app, 0, shared_config())?;
    let (q1, _k1) = open(&factory, &registry, &app, 1, shared_config())?;
    let region = q1.umem().clone();

    k0.deliver(&udp_frames(0..4));
    let mut out = Vec::new();
    assert_eq!(q0.rx_burst(&mut out, 64), 4);
    let mut frames = mbufs(&app, &udp_frames(10..18));
    assert_eq!(q0.tx_burst(&mut frames), 8);
    assert_eq!(app.in_use(), 2048 + 4 + 8);

    // The kernel keeps q0's buffers until every socket on the UMEM is closed.
    drop(q0);
    assert_eq!(region.parked(), 1024 + 8);
    assert_eq!(app.in_use(), 2048 + 4 + 8);

    drop(out);
    drop(q1);
    assert_eq!(region.refcount(), 1);
    drop(region);
    assert_eq!(app.in_use(), 0);
    Ok(())
}
