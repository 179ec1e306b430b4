use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ember_core::timer::TimerHeap;
use std::time::{Duration, Instant};

const CONNS: i32 = 10_000;

fn filled(base: Instant) -> TimerHeap<i32> {
    let mut heap = TimerHeap::with_capacity(CONNS as usize);
    for fd in 0..CONNS {
        let offset = (fd as u64 * 7919) % 30_000;
        heap.add_at(fd, base + Duration::from_millis(offset), || {});
    }
    heap
}

fn bench_add(c: &mut Criterion) {
    c.bench_function("timer_heap_add_10k", |b| {
        b.iter(|| {
            let heap = filled(Instant::now());
            black_box(heap.len())
        })
    });
}

fn bench_refresh(c: &mut Criterion) {
    let base = Instant::now();
    let mut heap = filled(base);
    let mut fd = 0;
    c.bench_function("timer_heap_refresh", |b| {
        b.iter(|| {
            fd = (fd + 4099) % CONNS;
            heap.update_at(fd, base + Duration::from_millis(30_000 + fd as u64));
        })
    });
}

fn bench_sweep(c: &mut Criterion) {
    c.bench_function("timer_heap_sweep_10k", |b| {
        b.iter(|| {
            let base = Instant::now();
            let mut heap = filled(base);
            black_box(heap.expire_sweep(base + Duration::from_secs(60)))
        })
    });
}

criterion_group!(benches, bench_add, bench_refresh, bench_sweep);
criterion_main!(benches);
