//! Throughput of the GF(256) parity kernel across level counts.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const BLOCK_SIZE: usize = 256 * 1024;
const DISKS: usize = 8;

fn bench_gen(c: &mut Criterion) {
    let mut group = c.benchmark_group("parity_gen");
    group.throughput(Throughput::Bytes((DISKS * BLOCK_SIZE) as u64));

    for level in [1_usize, 2, 3, 6] {
        let mut bufs: Vec<Vec<u8>> = (0..DISKS + level)
            .map(|d| (0..BLOCK_SIZE).map(|j| ((d * 31 + j) % 256) as u8).collect())
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(level), &level, |b, &level| {
            b.iter(|| {
                fraid_raid::generate(DISKS, level, BLOCK_SIZE, black_box(&mut bufs));
            });
        });
    }
    group.finish();
}

fn bench_rec(c: &mut Criterion) {
    let mut group = c.benchmark_group("parity_rec");
    group.throughput(Throughput::Bytes(BLOCK_SIZE as u64));

    for failures in [1_usize, 2, 3] {
        let level = 3;
        let mut bufs: Vec<Vec<u8>> = (0..DISKS + level)
            .map(|d| (0..BLOCK_SIZE).map(|j| ((d * 17 + j) % 256) as u8).collect())
            .collect();
        fraid_raid::generate(DISKS, level, BLOCK_SIZE, &mut bufs);
        let failed: Vec<usize> = (0..failures).collect();

        group.bench_with_input(
            BenchmarkId::from_parameter(failures),
            &failed,
            |b, failed| {
                b.iter(|| {
                    let ok = fraid_raid::recover(failed, DISKS, level, BLOCK_SIZE, black_box(&mut bufs));
                    assert!(ok);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_gen, bench_rec);
criterion_main!(benches);
