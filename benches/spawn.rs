//! Allocation and spawn-path benchmarks.
//!
//! The runtime is built once and never started: the benchmarks target the
//! allocator fast paths and the queue hand-off, not task execution.

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use taskline::{
    CoreSet, Hint, IsolationLevel, Order, Protocol, Resource, ResourceHeader, Runtime, Task,
    TaskResult,
};

struct Nop;

impl Task for Nop {
    fn execute(&mut self, _core_id: u16, _channel_id: u16) -> TaskResult {
        TaskResult::remove()
    }
}

#[repr(C)]
struct Payload {
    header: ResourceHeader,
    data: [u64; 4],
}

unsafe impl Resource for Payload {}

impl Payload {
    fn new() -> Self {
        Self {
            header: ResourceHeader::new(),
            data: [0; 4],
        }
    }
}

fn bench_task_cells(c: &mut Criterion) {
    let runtime = Runtime::init(CoreSet::build(1, Order::Ascending), 0, false).unwrap();

    let mut group = c.benchmark_group("task_cells");
    group.throughput(Throughput::Elements(1));

    // LIFO hot path: the freed cell is immediately reused.
    group.bench_function("alloc_free_pair", |b| {
        b.iter(|| unsafe {
            let task = runtime.new_task(0, Nop);
            runtime.delete_task(0, black_box(task));
        });
    });

    group.bench_function("alloc_1024_then_free", |b| {
        b.iter(|| unsafe {
            let tasks: Vec<_> = (0..1024).map(|_| runtime.new_task(0, Nop)).collect();
            for task in tasks {
                runtime.delete_task(0, task);
            }
        });
    });

    group.finish();
    drop(runtime);
}

fn bench_resources(c: &mut Criterion) {
    let runtime = Runtime::init(CoreSet::build(1, Order::Ascending), 0, false).unwrap();

    let mut group = c.benchmark_group("resources");
    group.throughput(Throughput::Elements(1));

    group.bench_function("build_destroy_latched", |b| {
        b.iter(|| {
            let resource = runtime.new_resource(
                size_of::<Payload>(),
                Hint::new()
                    .isolation(IsolationLevel::Exclusive)
                    .protocol(Protocol::Latch),
                Payload::new(),
            );
            unsafe { runtime.delete_resource(black_box(resource)) };
        });
    });

    group.finish();
    drop(runtime);
}

criterion_group!(benches, bench_task_cells, bench_resources);
criterion_main!(benches);
