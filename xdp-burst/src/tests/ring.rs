use crate::ring::{Ring, RingError, XdpDesc};

fn pair(size: u32) -> (Ring<u64>, Ring<u64>) {
    let producer = Ring::<u64>::anonymous(size).unwrap();
    let consumer = producer.peer();
    (producer, consumer)
}

fn produce(ring: &mut Ring<u64>, values: &[u64]) {
    let n = values.len() as u32;
    let idx = ring.reserve(n).unwrap();
    for (i, &v) in values.iter().enumerate() {
        ring.write(idx.wrapping_add(i as u32), v);
    }
    ring.submit(n);
}

fn consume(ring: &mut Ring<u64>, max: u32) -> Vec<u64> {
    let (n, idx) = ring.peek(max);
    let values = (0..n).map(|i| ring.read(idx.wrapping_add(i))).collect();
    ring.release(n);
    values
}

#[test]
fn reserve_is_all_or_nothing() {
    let (mut producer, mut consumer) = pair(8);
    produce(&mut producer, &[1, 2, 3, 4, 5]);
    assert_eq!(producer.reserve(4), Err(RingError::RingFull));
    assert_eq!(producer.cached().0, 5);
    produce(&mut producer, &[6, 7, 8]);
    assert_eq!(producer.reserve(1), Err(RingError::RingFull));

    assert_eq!(consume(&mut consumer, 2), vec![1, 2]);
    // The freed slots become visible once the producer refreshes its view.
    assert_eq!(producer.free_slots(2), 2);
    produce(&mut producer, &[9, 10]);
    assert_eq!(consume(&mut consumer, 16), vec![3, 4, 5, 6, 7, 8, 9, 10]);
}

#[test]
fn peek_returns_at_most_what_was_published() {
    let (mut producer, mut consumer) = pair(16);
    assert_eq!(consumer.peek(4).0, 0);

    let idx = producer.reserve(6).unwrap();
    for i in 0..6 {
        producer.write(idx + i, i as u64);
    }
    producer.submit(3);
    assert_eq!(consume(&mut consumer, 10), vec![0, 1, 2]);
    producer.submit(3);
    assert_eq!(consume(&mut consumer, 2), vec![3, 4]);
    assert_eq!(consume(&mut consumer, 2), vec![5]);
    assert_eq!(consumer.occupancy(), 0);
}

#[test]
fn indices_wrap_around() {
    let (mut producer, mut consumer) = pair(4);
    let mut next = 0u64;
    for round in 0..1000u64 {
        let n = (round % 4 + 1) as usize;
        let values: Vec<u64> = (next..next + n as u64).collect();
        produce(&mut producer, &values);
        next += n as u64;
        assert_eq!(consume(&mut consumer, 4), values);
    }
    assert_eq!(producer.cached().0, next as u32);
}

#[test]
fn cancelled_reservations_are_reused() {
    let (mut producer, mut consumer) = pair(8);
    let idx = producer.reserve(4).unwrap();
    producer.write(idx, 10);
    producer.write(idx + 1, 11);
    producer.cancel_reserve(2);
    producer.submit(2);
    produce(&mut producer, &[12]);
    assert_eq!(consume(&mut consumer, 8), vec![10, 11, 12]);
}

#[test]
fn cancelled_peek_is_returned_again() {
    let (mut producer, mut consumer) = pair(8);
    produce(&mut producer, &[1, 2, 3]);
    let (n, idx) = consumer.peek(8);
    assert_eq!(n, 3);
    consumer.cancel_peek(n);
    assert_eq!(consumer.peek(8), (3, idx));
    consumer.release(3);
    assert_eq!(producer.free_slots(8), 8);
}

#[test]
fn need_wakeup_flag_is_shared() {
    let (producer, consumer) = pair(8);
    assert!(!producer.needs_wakeup());
    consumer.set_need_wakeup(true);
    assert!(producer.needs_wakeup());
    consumer.set_need_wakeup(false);
    assert!(!producer.needs_wakeup());
}

#[test]
fn ring_size_must_be_a_power_of_two() {
    let err = Ring::<XdpDesc>::anonymous(24).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    assert!(Ring::<XdpDesc>::anonymous(0).is_err());
    assert_eq!(Ring::<XdpDesc>::anonymous(32).unwrap().capacity(), 32);
}
