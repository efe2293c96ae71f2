//! Benchmarks for simkernel
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use simkernel::mm::{BuddyAllocator, MemoryManager};
use simkernel::*;

fn bench_buddy(c: &mut Criterion) {
    let mut group = c.benchmark_group("buddy");

    for order in [0u8, 2, 6] {
        let mut buddy = BuddyAllocator::new(16384);
        group.bench_with_input(BenchmarkId::new("alloc_free", order), &order, |b, &order| {
            b.iter(|| {
                let block = buddy.alloc(black_box(order)).unwrap();
                buddy.free(block, order).unwrap();
            })
        });
    }

    group.bench_function("alloc_frames_3", |b| {
        let mut buddy = BuddyAllocator::new(16384);
        b.iter(|| {
            let start = buddy.alloc_frames(black_box(3)).unwrap();
            buddy.free_range(start, 3).unwrap();
        })
    });

    group.finish();
}

fn bench_pages(c: &mut Criterion) {
    let config = KernelConfig::default();
    let mut mm = MemoryManager::new(&config.memory);
    mm.create_address_space(2).unwrap();

    c.bench_function("allocate_free_pages_4", |b| {
        b.iter(|| {
            let alloc = mm.allocate_pages(2, black_box(4)).unwrap();
            mm.free_pages(2, &alloc.frames).unwrap();
        })
    });
}

fn bench_slab(c: &mut Criterion) {
    let config = KernelConfig::default();
    let mut mm = MemoryManager::new(&config.memory);

    let mut group = c.benchmark_group("slab");
    for size in [24usize, 200, 2000] {
        group.bench_with_input(BenchmarkId::new("alloc_free", size), &size, |b, &size| {
            b.iter(|| {
                let obj = mm.allocate_kernel(black_box(size)).unwrap();
                mm.free_kernel(obj.addr).unwrap();
            })
        });
    }
    group.finish();
}

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");

    for algorithm in [
        SchedulerAlgorithm::RoundRobin,
        SchedulerAlgorithm::Priority,
        SchedulerAlgorithm::Mlfq,
    ] {
        let kernel = Kernel::boot(KernelConfig::default().with_algorithm(algorithm)).unwrap();
        for i in 0..32u8 {
            kernel.create_process("bench", INIT_PID, 0, 0, i % 10).unwrap();
        }
        group.bench_function(algorithm.to_string(), |b| b.iter(|| kernel.tick().unwrap()));
    }

    group.finish();
}

criterion_group!(benches, bench_buddy, bench_pages, bench_slab, bench_tick);

criterion_main!(benches);
