//! The runtime façade: the only supported way into the engine.
//!
//! A [`Runtime`] owns the allocators, the scheduler and the resource
//! builder. It is a process-scoped handle: constructing a second one while
//! the first is live fails, and the guard clears when the runtime drops.
//! `start_and_wait` pins one worker thread per core of the core set (plus
//! the epoch thread when reclamation is on) and blocks until a task stops
//! the runtime or `stop` is called from outside.

use core::sync::atomic::{AtomicBool, Ordering};
use std::path::Path;

use crate::builder::Builder;
use crate::epoch::{MemoryReclamation, ReclaimGarbageTask};
use crate::profile::Profiler;
use crate::resource::{Hint, Resource, ResourcePtr};
use crate::resource_alloc::DynamicAllocator;
use crate::scheduler::Scheduler;
use crate::stats::Counter;
use crate::task::{RawTask, Task, TaskRef};
use crate::task_alloc::TaskAllocator;
use crate::topology::{self, CoreSet};
use crate::worker::WorkerContext;

/// Construction-time failures. Everything after construction is treated as
/// a programming error and panics.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("core set is empty")]
    EmptyCoreSet,
    #[error("another runtime is live in this process")]
    AlreadyLive,
    #[error("prefetch distance {0} does not fit the task buffer")]
    InvalidPrefetchDistance(u16),
}

/// Run-time knobs of a runtime instance.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Ready-buffer prefetch distance; 0 disables prefetching.
    pub prefetch_distance: u16,
    /// Allocate task cells from the system heap instead of the
    /// NUMA-partitioned slab.
    pub use_system_allocator: bool,
    /// How workers publish epochs for memory reclamation.
    pub reclamation: MemoryReclamation,
    /// Collect garbage on the owning channels instead of the epoch thread.
    pub local_garbage_collection: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            prefetch_distance: 0,
            use_system_allocator: false,
            reclamation: MemoryReclamation::Periodic,
            local_garbage_collection: false,
        }
    }
}

/// One live runtime per process.
static RUNTIME_LIVE: AtomicBool = AtomicBool::new(false);

pub struct Runtime {
    options: RuntimeOptions,
    resource_allocator: DynamicAllocator,
    task_allocator: TaskAllocator,
    scheduler: Scheduler,
    builder: Builder,
    profiler: Profiler,
}

impl Runtime {
    /// Initialize a runtime over the given cores.
    pub fn init(
        core_set: CoreSet,
        prefetch_distance: u16,
        use_system_allocator: bool,
    ) -> Result<Self, RuntimeError> {
        Self::init_with(
            core_set,
            RuntimeOptions {
                prefetch_distance,
                use_system_allocator,
                ..RuntimeOptions::default()
            },
        )
    }

    pub fn init_with(core_set: CoreSet, options: RuntimeOptions) -> Result<Self, RuntimeError> {
        if core_set.is_empty() {
            return Err(RuntimeError::EmptyCoreSet);
        }
        if options.prefetch_distance as usize >= crate::config::TASK_BUFFER_SIZE {
            return Err(RuntimeError::InvalidPrefetchDistance(
                options.prefetch_distance,
            ));
        }
        if RUNTIME_LIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RuntimeError::AlreadyLive);
        }

        if topology::is_numa_balancing_enabled() {
            tracing::warn!(
                "kernel NUMA balancing is enabled; it migrates pages the runtime just placed \
                 (disable via /proc/sys/kernel/numa_balancing)"
            );
        }

        tracing::debug!(
            ?core_set,
            prefetch_distance = options.prefetch_distance,
            ?options.reclamation,
            "runtime initialized"
        );

        Ok(Self {
            task_allocator: TaskAllocator::new(&core_set, options.use_system_allocator),
            resource_allocator: DynamicAllocator::new(),
            scheduler: Scheduler::new(
                core_set,
                options.prefetch_distance,
                options.local_garbage_collection,
            ),
            builder: Builder::new(),
            profiler: Profiler::new(),
            options,
        })
    }

    /// Number of channels (== workers == cores in the core set).
    pub fn channels(&self) -> u16 {
        self.scheduler.count_channels()
    }

    /// NUMA node of a channel.
    pub fn numa_node_id(&self, channel_id: u16) -> u8 {
        self.scheduler.numa_node_id(channel_id)
    }

    /// Allocate a task cell on `core_id`'s heap and construct `value` in it.
    ///
    /// # Safety
    /// The per-core heaps are single-owner: the caller must either be the
    /// worker pinned to `core_id`, or no worker may be using that heap
    /// concurrently (e.g. before `start_and_wait`).
    pub unsafe fn new_task<T: Task>(&self, core_id: u16, value: T) -> TaskRef {
        unsafe {
            let cell = self.task_allocator.allocate(core_id);
            RawTask::init_in_cell(cell, value)
        }
    }

    /// Return an unspawned task to the allocator.
    ///
    /// # Safety
    /// Same single-owner contract as [`new_task`](Self::new_task).
    pub unsafe fn delete_task(&self, core_id: u16, task: TaskRef) {
        unsafe {
            let raw = task.into_raw();
            RawTask::drop_payload(raw);
            self.task_allocator.free(core_id, raw);
        }
    }

    /// Allocate `size` bytes on the placed NUMA node and construct `value`
    /// there, registering the resource with its home channel.
    pub fn new_resource<T: Resource>(&self, size: usize, hint: Hint, value: T) -> ResourcePtr {
        self.builder
            .build(&self.scheduler, &self.resource_allocator, size, hint, value)
    }

    /// Tag an externally owned object as a resource. The caller keeps
    /// ownership; such a pointer must not be passed to `delete_resource`.
    pub fn to_resource<T: Resource>(&self, object: *mut T, hint: Hint) -> ResourcePtr {
        self.builder.wrap(&self.scheduler, object, hint)
    }

    /// Delete a resource created by [`new_resource`](Self::new_resource).
    /// Optimistically synchronized resources are reclaimed epoch-safe, the
    /// rest immediately.
    ///
    /// # Safety
    /// `resource` must come from `new_resource`, no new tasks may reference
    /// it, and it must not be deleted twice.
    pub unsafe fn delete_resource(&self, resource: ResourcePtr) {
        unsafe {
            self.builder.destroy(
                &self.scheduler,
                &self.resource_allocator,
                resource,
                self.options.reclamation.is_enabled(),
            )
        };
    }

    /// Spawn from outside the workers. The task must be annotated with a
    /// resource or a channel.
    pub fn spawn(&self, task: TaskRef) {
        self.scheduler.schedule_remote(task);
    }

    /// Spawn from the worker owning `current_channel_id`.
    ///
    /// # Safety
    /// The caller must be the worker thread owning `current_channel_id`
    /// (tasks receive their channel id in `execute`), or no worker may be
    /// running yet.
    pub unsafe fn spawn_from(&self, task: TaskRef, current_channel_id: u16) {
        unsafe { self.scheduler.schedule(task, current_channel_id) };
    }

    /// Update a resource's usage prediction on its home channel.
    pub fn modify_predicted_usage(
        &self,
        resource: ResourcePtr,
        old: crate::resource::AccessFrequency,
        new: crate::resource::AccessFrequency,
    ) {
        self.scheduler
            .modify_predicted_usage(resource.channel_id(), old, new);
    }

    /// Start the workers and block until the runtime is stopped.
    pub fn start_and_wait(&self) {
        assert!(!self.scheduler.is_running(), "runtime is already running");

        let reclamation = self.options.reclamation;
        let count_channels = self.scheduler.count_channels();

        // Long-lived per-channel reclaim probes for local garbage
        // collection; idle flags gate re-spawning.
        let reclaim_idle: Box<[AtomicBool]> = (0..count_channels)
            .map(|_| AtomicBool::new(true))
            .collect();
        let mut reclaim_cells: Vec<ReclaimCell> = Vec::new();
        if reclamation.is_enabled() && self.options.local_garbage_collection {
            for channel_id in 0..count_channels {
                let cell = alloc_reclaim_cell();
                let mut task = unsafe {
                    RawTask::init(
                        cell,
                        ReclaimGarbageTask {
                            epochs: self.scheduler.epochs() as *const _,
                            allocator: &self.resource_allocator as *const _,
                            idle: &reclaim_idle[channel_id as usize] as *const _,
                        },
                    )
                };
                task.annotate_channel(channel_id);
                unsafe { RawTask::mark_heap_backed(task.into_raw()) };
                reclaim_cells.push(ReclaimCell(cell));
            }
        }

        tracing::debug!(workers = count_channels, "starting runtime");

        std::thread::scope(|scope| {
            for worker in self.scheduler.workers() {
                scope.spawn(move || {
                    let ctx = WorkerContext {
                        scheduler: &self.scheduler,
                        task_allocator: &self.task_allocator,
                        statistics: self.scheduler.statistics(),
                        epochs: self.scheduler.epochs(),
                        is_running: self.scheduler.running_flag(),
                        reclamation,
                    };
                    unsafe { worker.run(&ctx) };
                });
            }

            if reclamation.is_enabled() {
                let reclaim_cells = &reclaim_cells;
                let reclaim_idle = &reclaim_idle;
                scope.spawn(move || {
                    self.scheduler.epochs().run_epoch_thread(
                        self.scheduler.running_flag(),
                        &self.resource_allocator,
                        &|channel_id| {
                            let idle = &reclaim_idle[channel_id as usize];
                            if idle.swap(false, Ordering::AcqRel) {
                                self.scheduler.schedule_remote(TaskRef::from_raw(
                                    reclaim_cells[channel_id as usize].0,
                                ));
                            }
                        },
                    );
                });
            }

            self.scheduler.start();
        });

        // All workers joined. Tasks still in backend queues are discarded;
        // their cells go back to the allocator (heap-backed probes stay with
        // their owners).
        for worker in self.scheduler.workers() {
            let core_id = worker.core_id();
            let mut discard = |task: *mut RawTask| unsafe {
                if !(*task).annotation.is_heap_backed() {
                    RawTask::drop_payload(task);
                    self.task_allocator.free(core_id, task);
                }
            };
            unsafe { worker.channel().drain(&mut discard) };
        }

        // Nothing reads resource memory anymore, so the remaining garbage
        // goes unconditionally.
        if reclamation.is_enabled() {
            unsafe { self.scheduler.epochs().reclaim_all(&self.resource_allocator) };
        }

        for cell in reclaim_cells {
            unsafe {
                RawTask::drop_payload(cell.0);
                free_reclaim_cell(cell.0);
            }
        }

        self.profiler.write_output();
        tracing::debug!("runtime stopped");
    }

    /// Interrupt the workers; each finishes its ready buffer and exits.
    /// Tasks still in backend queues are discarded.
    pub fn stop(&self) {
        self.scheduler.interrupt();
    }

    /// Enable idle-time profiling; results are written to `path` as JSON
    /// when the runtime stops.
    pub fn profile<P: AsRef<Path>>(&self, path: P) {
        self.profiler.enable(path.as_ref().to_path_buf());
        self.profiler.attach(&self.scheduler);
    }

    /// A counter aggregated over all channels.
    pub fn statistic(&self, counter: Counter) -> u64 {
        self.scheduler.statistics().total(counter)
    }

    /// A counter of one channel.
    pub fn statistic_for(&self, counter: Counter, channel_id: u16) -> u64 {
        self.scheduler.statistics().get(counter, channel_id)
    }

    /// Clear counters and, when no resource memory is in use, epochs.
    pub fn reset_statistics(&self) {
        self.scheduler.reset(&self.resource_allocator);
    }

    /// True when all resource memory has been returned (quiescence probe).
    pub fn resource_heap_is_free(&self) -> bool {
        self.resource_allocator.is_free()
    }

    /// Return fully free resource blocks to the OS and rebuild the per-node
    /// minimum. Requires exclusive access, i.e. no workers running.
    pub fn defragment_resources(&mut self) {
        self.resource_allocator.defragment();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        RUNTIME_LIVE.store(false, Ordering::Release);
    }
}

struct ReclaimCell(*mut RawTask);
unsafe impl Send for ReclaimCell {}
unsafe impl Sync for ReclaimCell {}

// Reclaim probes are spawned by the epoch thread, which owns no core heap;
// their cells come from the process heap and are never freed by workers
// (the task returns `null`).
fn reclaim_layout() -> std::alloc::Layout {
    std::alloc::Layout::from_size_align(
        crate::config::TASK_HEADER_SIZE + size_of::<ReclaimGarbageTask>(),
        64,
    )
    .unwrap()
}

fn alloc_reclaim_cell() -> *mut RawTask {
    let cell = unsafe { std::alloc::alloc(reclaim_layout()) };
    assert!(!cell.is_null(), "reclaim probe allocation failed");
    cell.cast()
}

unsafe fn free_reclaim_cell(cell: *mut RawTask) {
    unsafe { std::alloc::dealloc(cell.cast(), reclaim_layout()) };
}
