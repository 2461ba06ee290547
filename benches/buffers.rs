use cognis_runtime::buffers::{RingBuffer, RollingStats};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_ring_buffer_add(c: &mut Criterion) {
    c.bench_function("ring_buffer_add_at_capacity", |b| {
        let mut buf: RingBuffer<u64> = RingBuffer::new(256);
        for i in 0..256 {
            buf.add(i);
        }
        b.iter(|| {
            buf.add(black_box(42));
        });
    });
}

fn bench_ring_buffer_recent(c: &mut Criterion) {
    c.bench_function("ring_buffer_recent_k", |b| {
        let mut buf: RingBuffer<u64> = RingBuffer::new(1024);
        for i in 0..1024 {
            buf.add(i);
        }
        b.iter(|| black_box(buf.recent(black_box(64))));
    });
}

fn bench_rolling_stats_p95(c: &mut Criterion) {
    c.bench_function("rolling_stats_p95", |b| {
        let mut stats = RollingStats::new(512);
        for i in 0..512 {
            stats.record(i as f64);
        }
        b.iter(|| black_box(stats.p95()));
    });
}

criterion_group!(
    benches,
    bench_ring_buffer_add,
    bench_ring_buffer_recent,
    bench_rolling_stats_p95
);
criterion_main!(benches);
