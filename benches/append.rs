use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use jlog::{Log, LogConfig, Safety};

const APPENDS_PER_ITER: usize = 10_000;
const SYNCED_APPENDS_PER_ITER: usize = 200;

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    for &size in &[64_usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let dir = tempdir().expect("tempdir");
                    let config = LogConfig {
                        safety: Safety::Unsafe,
                        ..LogConfig::default()
                    };
                    let log = Log::create(dir.path().join("bench_log"), config).expect("log");
                    let writer = log.writer().expect("writer");
                    let payload = vec![0u8; size];
                    (dir, writer, payload)
                },
                |(_dir, mut writer, payload)| {
                    for _ in 0..APPENDS_PER_ITER {
                        writer.append(black_box(&payload)).expect("append");
                    }
                    writer.flush().expect("flush");
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_append_safe(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_safe");
    group.sample_size(10);
    group.bench_function("256", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().expect("tempdir");
                let config = LogConfig {
                    safety: Safety::Safe,
                    ..LogConfig::default()
                };
                let log = Log::create(dir.path().join("bench_log"), config).expect("log");
                let writer = log.writer().expect("writer");
                (dir, writer, vec![0u8; 256])
            },
            |(_dir, mut writer, payload)| {
                for _ in 0..SYNCED_APPENDS_PER_ITER {
                    writer.append(black_box(&payload)).expect("append");
                }
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

fn bench_rollover(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_rollover");
    group.bench_function("1k_per_segment", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().expect("tempdir");
                let config = LogConfig {
                    max_messages: Some(1_000),
                    safety: Safety::Unsafe,
                    ..LogConfig::default()
                };
                let log = Log::create(dir.path().join("bench_log"), config).expect("log");
                let writer = log.writer().expect("writer");
                (dir, writer)
            },
            |(_dir, mut writer)| {
                for _ in 0..APPENDS_PER_ITER {
                    writer.append(black_box(b"rollover payload")).expect("append");
                }
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_append, bench_append_safe, bench_rollover);
criterion_main!(benches);
