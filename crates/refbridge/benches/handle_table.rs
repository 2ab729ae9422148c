//! Handle table benchmarks: create/release churn, retain/release on a hot
//! handle, and dereference from several threads.

use std::hint::black_box;
use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use refbridge::heap::Heap;
use refbridge::{Runtime, RuntimeConfig, ThreadKind};

const BATCH: usize = 1_000;

fn runtime() -> (Arc<Heap>, Arc<Runtime>) {
    let heap = Arc::new(Heap::new());
    let config = RuntimeConfig::default()
        .with_cyclic_background(false)
        .with_leak_check(false);
    let runtime = Runtime::new(config, heap.clone()).expect("runtime");
    (heap, runtime)
}

fn bench_create_release(c: &mut Criterion) {
    let (heap, runtime) = runtime();
    let _attached = runtime.attach_current_thread(ThreadKind::Mutator);
    let obj = heap.allocate(0);
    let refs = runtime.refs();

    c.bench_function("create_release_shared", |b| {
        b.iter(|| {
            let handle = refs.create_shared(black_box(obj)).unwrap();
            refs.release(handle).unwrap();
        });
    });

    c.bench_function("create_release_local", |b| {
        b.iter(|| {
            let handle = refs.create_local(black_box(obj)).unwrap();
            refs.release(handle).unwrap();
        });
    });

    c.bench_function("create_batch_then_release", |b| {
        b.iter_batched(
            || Vec::with_capacity(BATCH),
            |mut handles| {
                for _ in 0..BATCH {
                    handles.push(refs.create_shared(obj).unwrap());
                }
                for handle in handles.drain(..) {
                    refs.release(handle).unwrap();
                }
                handles
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_retain_release(c: &mut Criterion) {
    let (heap, runtime) = runtime();
    let _attached = runtime.attach_current_thread(ThreadKind::Mutator);
    let refs = runtime.refs();
    let handle = refs.create_shared(heap.allocate(0)).unwrap();

    c.bench_function("retain_release", |b| {
        b.iter(|| {
            refs.retain(black_box(handle)).unwrap();
            refs.release(black_box(handle)).unwrap();
        });
    });

    c.bench_function("dereference", |b| {
        b.iter(|| black_box(refs.dereference(black_box(handle)).unwrap()));
    });

    refs.release(handle).unwrap();
}

fn bench_contended_retain(c: &mut Criterion) {
    let (heap, runtime) = runtime();
    let handle = {
        let _attached = runtime.attach_current_thread(ThreadKind::Mutator);
        runtime.refs().create_shared(heap.allocate(0)).unwrap()
    };

    c.bench_function("retain_release_4_threads", |b| {
        b.iter(|| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let runtime = Arc::clone(&runtime);
                    thread::spawn(move || {
                        for _ in 0..BATCH {
                            runtime.refs().retain(handle).unwrap();
                            runtime.refs().release(handle).unwrap();
                        }
                    })
                })
                .collect();
            for worker in workers {
                worker.join().unwrap();
            }
        });
    });

    let _attached = runtime.attach_current_thread(ThreadKind::Mutator);
    runtime.refs().release(handle).unwrap();
}

criterion_group!(
    benches,
    bench_create_release,
    bench_retain_release,
    bench_contended_retain
);
criterion_main!(benches);
