use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use criterion::{Criterion, criterion_group, criterion_main};

use prcu::Prcu;

fn read_side(c: &mut Criterion) {
    let prcu = Prcu::new(8);
    c.bench_function("read_lock_unlock", |b| {
        b.iter(|| {
            prcu.read_lock(black_box(0));
            prcu.read_unlock(black_box(0));
        })
    });

    c.bench_function("read_lock_unlock_nested4", |b| {
        b.iter(|| {
            for _ in 0..4 {
                prcu.read_lock(0);
            }
            for _ in 0..4 {
                prcu.read_unlock(0);
            }
        })
    });
}

fn grace_period(c: &mut Criterion) {
    let prcu = Prcu::new(8);
    c.bench_function("synchronize_quiescent", |b| {
        b.iter(|| black_box(prcu.synchronize(0)))
    });
}

fn callbacks(c: &mut Criterion) {
    let prcu = Prcu::new(8);
    let hits = Arc::new(AtomicUsize::new(0));
    c.bench_function("call_synchronize_drain_64", |b| {
        b.iter(|| {
            for i in 0..64usize {
                let hits = Arc::clone(&hits);
                prcu.call(
                    i % 8,
                    Box::new(move || {
                        hits.fetch_add(1, Ordering::Relaxed);
                    }),
                );
            }
            prcu.synchronize(0);
            for cpu in 0..8 {
                prcu.process_callbacks(cpu);
            }
        })
    });
}

criterion_group!(benches, read_side, grace_period, callbacks);
criterion_main!(benches);
