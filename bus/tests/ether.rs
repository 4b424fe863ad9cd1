//! End-to-end ordering across threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bus::{Backing, Cursor, Ether, EtherError};

#[derive(Clone, Copy, Debug)]
#[repr(C)]
struct Sample {
    value: u64,
}

bus::messages! {
    enum WireMsg {
        Sample(Sample),
    }
}

fn fresh(capacity: usize) -> Arc<Ether<WireMsg>> {
    let backing = Backing::private(Ether::<WireMsg>::required_size(capacity));
    Arc::new(Ether::initialize("wire", capacity, backing, true).expect("initialize"))
}

#[test]
fn one_producer_two_readers_see_identical_order() {
    const CAPACITY: usize = 4096;
    const MESSAGES: u64 = 10_000;

    let ether = fresh(CAPACITY);
    let mut cursors: Vec<Cursor<WireMsg>> =
        (0..2).map(|_| Cursor::new(Arc::clone(&ether))).collect();
    let progress: Arc<[AtomicU64; 2]> = Arc::new([AtomicU64::new(0), AtomicU64::new(0)]);

    std::thread::scope(|s| {
        for (reader, cursor) in cursors.drain(..).enumerate() {
            let progress = Arc::clone(&progress);
            s.spawn(move || {
                let mut cursor = cursor;
                let expected = std::cell::Cell::new(0u64);
                let mut sink = |m: WireMsg| {
                    let WireMsg::Sample(sample) = m;
                    assert_eq!(
                        sample.value,
                        expected.get(),
                        "reader {reader} saw a gap or duplicate"
                    );
                    expected.set(expected.get() + 1);
                };
                while expected.get() < MESSAGES {
                    match cursor.poll_one(&mut sink) {
                        Ok(true) => progress[reader].store(expected.get(), Ordering::Release),
                        Ok(false) => std::hint::spin_loop(),
                        Err(e) => panic!("reader {reader} failed: {e}"),
                    }
                }
            });
        }

        let producer_ether = Arc::clone(&ether);
        let producer_progress = Arc::clone(&progress);
        s.spawn(move || {
            for value in 0..MESSAGES {
                // Stay well inside one lap of the slowest reader so this
                // test asserts ordering, not overrun policy.
                loop {
                    let slowest = producer_progress
                        .iter()
                        .map(|p| p.load(Ordering::Acquire))
                        .min()
                        .unwrap_or(0);
                    if value - slowest < (CAPACITY as u64) / 2 {
                        break;
                    }
                    std::thread::yield_now();
                }
                producer_ether.publish(Sample { value });
            }
        });
    });
}

#[test]
fn stale_cursor_reports_lapped_once_overrun() {
    let ether = fresh(8);
    let mut cursor = Cursor::new(Arc::clone(&ether));

    for value in 0..100u64 {
        ether.publish(Sample { value });
    }

    let mut sink = |_: WireMsg| panic!("lapped cursor must not deliver");
    match cursor.poll_one(&mut sink) {
        Err(EtherError::ReaderLapped { next_seq, behind }) => {
            assert_eq!(next_seq, 1);
            assert_eq!(behind, 99);
        }
        other => panic!("expected ReaderLapped, got {other:?}"),
    }
}

#[test]
fn multiple_producers_never_collide_on_sequences() {
    const CAPACITY: usize = 1024;
    const PER_PRODUCER: u64 = 200;

    let ether = fresh(CAPACITY);
    let mut cursor = Cursor::new(Arc::clone(&ether));

    std::thread::scope(|s| {
        for p in 0..4u64 {
            let ether = Arc::clone(&ether);
            s.spawn(move || {
                for i in 0..PER_PRODUCER {
                    ether.publish(Sample {
                        value: p * PER_PRODUCER + i,
                    });
                }
            });
        }
    });

    let mut seen = Vec::new();
    let mut sink = |m: WireMsg| {
        let WireMsg::Sample(sample) = m;
        seen.push(sample.value);
    };
    while cursor.poll_one(&mut sink).expect("read") {}

    // All claims landed, each exactly once, regardless of interleaving.
    assert_eq!(seen.len() as u64, 4 * PER_PRODUCER);
    seen.sort_unstable();
    for (i, v) in seen.iter().enumerate() {
        assert_eq!(*v, i as u64);
    }
}
