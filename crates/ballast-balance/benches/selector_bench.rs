// Criterion benchmarks for ballast-balance
//
// Run benchmarks with:
//   cargo bench -p ballast-balance
//
// For detailed output with plots:
//   cargo bench -p ballast-balance -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use ballast_balance::registry::BackendInfo;
use ballast_balance::selector::{
    LeastRequest, Maglev, PeakEwma, Random, RingHash, Selector, WeightedRoundRobin,
};

fn backends(n: usize) -> Vec<BackendInfo> {
    (0..n)
        .map(|i| BackendInfo {
            address: format!("10.0.{}.{}:9000", i / 256, i % 256).parse().unwrap(),
            weight: (i as u32 % 4) + 1,
            active_requests: (i as u32 * 7) % 13,
        })
        .collect()
}

fn bench_choose(c: &mut Criterion) {
    let mut group = c.benchmark_group("choose");

    for count in [4usize, 16, 64] {
        let set = backends(count);

        let mut wrr = WeightedRoundRobin::new();
        wrr.on_membership_change(&set);
        group.bench_with_input(BenchmarkId::new("wrr", count), &count, |b, _| {
            b.iter(|| wrr.choose(black_box(42), &set, 0));
        });

        let mut lr = LeastRequest::new(1.0, 7);
        lr.on_membership_change(&set);
        group.bench_with_input(BenchmarkId::new("least_request", count), &count, |b, _| {
            b.iter(|| lr.choose(black_box(42), &set, 0));
        });

        let mut random = Random::new(7);
        random.on_membership_change(&set);
        group.bench_with_input(BenchmarkId::new("random", count), &count, |b, _| {
            b.iter(|| random.choose(black_box(42), &set, 0));
        });

        let mut ring = RingHash::new(1024, 8 * 1024 * 1024, 7);
        ring.on_membership_change(&set);
        group.bench_with_input(BenchmarkId::new("ring_hash", count), &count, |b, _| {
            let mut id = 0u64;
            b.iter(|| {
                id = id.wrapping_add(1);
                ring.choose(black_box(id), &set, 0)
            });
        });

        let mut maglev = Maglev::new(65537, 7);
        maglev.on_membership_change(&set);
        group.bench_with_input(BenchmarkId::new("maglev", count), &count, |b, _| {
            let mut id = 0u64;
            b.iter(|| {
                id = id.wrapping_add(1);
                maglev.choose(black_box(id), &set, 0)
            });
        });

        let mut ewma = PeakEwma::new(10_000_000_000, 7);
        ewma.on_membership_change(&set);
        group.bench_with_input(BenchmarkId::new("peak_ewma", count), &count, |b, _| {
            b.iter(|| ewma.choose(black_box(42), &set, 1_000));
        });
    }

    group.finish();
}

fn bench_table_builds(c: &mut Criterion) {
    let mut group = c.benchmark_group("membership_change");
    group.sample_size(20);

    for count in [4usize, 64] {
        let set = backends(count);

        group.bench_with_input(BenchmarkId::new("ring_hash", count), &count, |b, _| {
            let mut ring = RingHash::new(1024, 8 * 1024 * 1024, 7);
            b.iter(|| ring.on_membership_change(black_box(&set)));
        });

        group.bench_with_input(BenchmarkId::new("maglev_65537", count), &count, |b, _| {
            let mut maglev = Maglev::new(65537, 7);
            b.iter(|| maglev.on_membership_change(black_box(&set)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_choose, bench_table_builds);
criterion_main!(benches);
