//! Benchmarks for the wrapper pool and the cross-thread bridge

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use netbridge::bridge::{ExecutorHub, NoopWake, RecordPool, TaskRecord};
use netbridge::entity::{EntityKind, MessageData, NativeHandle};
use netbridge::host::Heap;
use netbridge::pool::WrapperPool;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Acquire, attach and release one message wrapper
fn bench_wrapper_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("wrapper_pool");

    for &max in &[0usize, 64] {
        let heap = Rc::new(Heap::new());
        let mut pool: WrapperPool<MessageData> = WrapperPool::new(Rc::clone(&heap), max);
        let mut next = 0u64;

        group.bench_function(format!("acquire_release_max_{}", max), |b| {
            b.iter(|| {
                next += 1;
                let native = NativeHandle::new(EntityKind::Message, next);
                let id = pool.acquire_attached(&native).unwrap();
                black_box(id);
                pool.release(id).unwrap();
                if max == 0 {
                    // Nothing is pooled; collect so the heap stays bounded.
                    for record in heap.collect_garbage() {
                        pool.finalize(&record);
                    }
                }
            })
        });
    }

    group.finish();
}

/// Submit a batch from one producer and drain it on the consumer side
fn bench_executor(c: &mut Criterion) {
    let mut group = c.benchmark_group("executor");

    for &batch in &[1usize, 64, 1024] {
        let mut hub = ExecutorHub::new(batch.max(1), 4096, 4096, Arc::new(NoopWake));
        let executor = hub.acquire().unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        group.throughput(Throughput::Elements(batch as u64));

        group.bench_function(format!("submit_drain_{}", batch), |b| {
            b.iter(|| {
                for _ in 0..batch {
                    let counter = Arc::clone(&counter);
                    executor
                        .submit(move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                        })
                        .unwrap();
                }
                black_box(hub.drain())
            })
        });
    }

    group.finish();
}

/// Record pool acquire/release under no contention
fn bench_record_pool(c: &mut Criterion) {
    let pool: RecordPool<TaskRecord> = RecordPool::new(64);

    c.bench_function("record_acquire_release", |b| {
        b.iter(|| {
            let record = pool.acquire();
            black_box(&record);
            pool.release(record);
        })
    });
}

criterion_group!(benches, bench_wrapper_pool, bench_executor, bench_record_pool);
criterion_main!(benches);
