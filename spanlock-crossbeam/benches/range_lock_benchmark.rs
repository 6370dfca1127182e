//! Benchmark comparing the range lock implementations on the disjoint
//! partition workload across thread counts.
//!
//! Run with: cargo bench --package spanlock-crossbeam --bench range_lock_benchmark

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use mimalloc::MiMalloc;
use std::sync::Arc;
use std::thread;

use spanlock_core::{CoarseRangeLock, LockFreeRangeLock, OptimisticRangeLock, RangeLock, SortedListRangeLock};
use spanlock_crossbeam::EpochGuard;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const RANGES_PER_THREAD: usize = 2_000;
const WIDTH: u64 = 256;

// Type aliases for convenience
type EpochLockFree = LockFreeRangeLock<EpochGuard>;
type EpochOptimistic = OptimisticRangeLock<EpochGuard>;
type EpochSortedList = SortedListRangeLock<EpochGuard>;

// ============================================================================
// Generic benchmark helpers for RangeLock
// ============================================================================

/// Each thread cycles acquire/release over its own disjoint slice of the
/// domain - the storage layer's fast path.
fn bench_partition_cycle<L>(num_threads: usize)
where
    L: RangeLock + Default + Send + Sync + 'static,
{
    let lock = Arc::new(L::default());

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let base = 1 + t as u64 * (RANGES_PER_THREAD as u64 + 1) * (WIDTH + 1);
                for i in 0..RANGES_PER_THREAD as u64 {
                    let start = base + i * (WIDTH + 1);
                    assert!(lock.try_lock(start, start + WIDTH));
                    assert!(lock.release_lock(start, start + WIDTH));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

/// Fill-then-drain: all ranges acquired before any release, so the list
/// grows to its full size.
fn bench_fill_drain<L>(num_threads: usize)
where
    L: RangeLock + Default + Send + Sync + 'static,
{
    let lock = Arc::new(L::default());

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let base = 1 + t as u64 * (RANGES_PER_THREAD as u64 + 1) * (WIDTH + 1);
                for i in 0..RANGES_PER_THREAD as u64 {
                    let start = base + i * (WIDTH + 1);
                    assert!(lock.try_lock(start, start + WIDTH));
                }
                for i in 0..RANGES_PER_THREAD as u64 {
                    let start = base + i * (WIDTH + 1);
                    assert!(lock.release_lock(start, start + WIDTH));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

fn partition_cycle_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition_cycle");
    group.sample_size(10);

    for threads in [1, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("lock_free", threads),
            &threads,
            |b, &t| b.iter(|| bench_partition_cycle::<EpochLockFree>(t)),
        );
        group.bench_with_input(
            BenchmarkId::new("optimistic", threads),
            &threads,
            |b, &t| b.iter(|| bench_partition_cycle::<EpochOptimistic>(t)),
        );
        group.bench_with_input(
            BenchmarkId::new("sorted_list", threads),
            &threads,
            |b, &t| b.iter(|| bench_partition_cycle::<EpochSortedList>(t)),
        );
        group.bench_with_input(
            BenchmarkId::new("coarse", threads),
            &threads,
            |b, &t| b.iter(|| bench_partition_cycle::<CoarseRangeLock>(t)),
        );
    }

    group.finish();
}

fn fill_drain_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("fill_drain");
    group.sample_size(10);

    for threads in [1, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("lock_free", threads),
            &threads,
            |b, &t| b.iter(|| bench_fill_drain::<EpochLockFree>(t)),
        );
        group.bench_with_input(
            BenchmarkId::new("optimistic", threads),
            &threads,
            |b, &t| b.iter(|| bench_fill_drain::<EpochOptimistic>(t)),
        );
        group.bench_with_input(
            BenchmarkId::new("coarse", threads),
            &threads,
            |b, &t| b.iter(|| bench_fill_drain::<CoarseRangeLock>(t)),
        );
    }

    group.finish();
}

criterion_group!(benches, partition_cycle_benchmark, fill_drain_benchmark);
criterion_main!(benches);
