use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use shmnic::ring::{flag, tristate, Desc, RingBuffer, DUPLEX_RING_SIZE, RING_SIZE};
use std::{sync::Arc, thread};

pub fn criterion_benchmark(c: &mut Criterion) {
    // Single-threaded produce/consume on one slot.
    c.bench_function("flag-pingpong", |b| {
        let ring = RingBuffer::<RING_SIZE>::boxed();
        let mut tx = flag::Producer::new();
        let mut rx = flag::Consumer::new();
        let desc = Desc::new(1, 0, 64);
        b.iter(|| {
            let _ = tx.produce(&ring, desc);
            rx.consume(&ring)
        })
    });

    c.bench_function("tristate-roundtrip", |b| {
        let ring = RingBuffer::<DUPLEX_RING_SIZE>::boxed();
        let mut guest = tristate::Submitter::new();
        let mut host = tristate::Processor::new();
        let desc = Desc::new(1, 0, 64);
        b.iter(|| {
            let _ = guest.submit(&ring, desc);
            host.take(&ring);
            let _ = host.complete(&ring, None);
            guest.reclaim(&ring)
        })
    });

    // A full ring's worth moved across threads.
    c.bench_function("flag-cross-thread", |b| {
        b.iter_batched(
            || Arc::new(RingBuffer::<RING_SIZE>::boxed()),
            |ring| {
                let r = ring.clone();
                let consumer = thread::spawn(move || {
                    let mut rx = flag::Consumer::new();
                    let mut n = 0;
                    while n < RING_SIZE {
                        if rx.consume(&r).is_some() {
                            n += 1;
                        }
                    }
                });
                let mut tx = flag::Producer::new();
                for i in 0..RING_SIZE {
                    while tx.produce(&ring, Desc::new(i as u64, 0, 64)).is_err() {}
                }
                consumer.join().unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
