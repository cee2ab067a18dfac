//! The worker: one pinned thread executing tasks from its channel.
//!
//! Each loop iteration refills the ready buffer and drains it. Per task the
//! worker selects the execution context from the annotated resource's
//! synchronization primitive: bare execution for unsynchronized and
//! channel-serialized resources, a latch for the pessimistic primitives, and
//! the save/validate/restore cycle for optimistic reads.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::channel::Channel;
use crate::config::TASK_SIZE;
use crate::epoch::{EpochManager, MemoryReclamation};
use crate::platform;
use crate::primitive::Primitive;
use crate::resource::ResourcePtr;
use crate::scheduler::Scheduler;
use crate::stats::{Counter, Statistics};
use crate::task::{RawTask, ResultKind, Task, TaskRef, TaskResult};
use crate::task_alloc::TaskAllocator;

/// Saved task bytes for optimistic restarts. A failed validation restores
/// the cell and re-runs the task, so `execute` must be deterministic in its
/// inputs for the restart to be sound.
#[repr(align(64))]
pub(crate) struct TaskStack {
    data: [u8; TASK_SIZE],
}

impl TaskStack {
    pub(crate) const fn new() -> Self {
        Self {
            data: [0; TASK_SIZE],
        }
    }

    #[inline]
    pub(crate) fn save(&mut self, task: *const RawTask) {
        unsafe {
            core::ptr::copy_nonoverlapping(task.cast::<u8>(), self.data.as_mut_ptr(), TASK_SIZE)
        };
    }

    #[inline]
    pub(crate) fn restore(&self, task: *mut RawTask) {
        unsafe { core::ptr::copy_nonoverlapping(self.data.as_ptr(), task.cast::<u8>(), TASK_SIZE) };
    }
}

/// Everything a worker borrows from the runtime while it runs.
pub(crate) struct WorkerContext<'a> {
    pub(crate) scheduler: &'a Scheduler,
    pub(crate) task_allocator: &'a TaskAllocator,
    pub(crate) statistics: &'a Statistics,
    pub(crate) epochs: &'a EpochManager,
    pub(crate) is_running: &'a AtomicBool,
    pub(crate) reclamation: MemoryReclamation,
}

/// Sets the running flag to false; spawned by a task returning
/// [`TaskResult::stop`] and routed to the first channel.
pub(crate) struct StopTask {
    pub(crate) is_running: *const AtomicBool,
}

// Points at the scheduler's running flag, which outlives all workers.
unsafe impl Send for StopTask {}

impl Task for StopTask {
    fn execute(&mut self, _core_id: u16, _channel_id: u16) -> TaskResult {
        unsafe { (*self.is_running).store(false, Ordering::Release) };
        TaskResult::remove()
    }
}

/// One worker, owning its channel and its optimistic-restart stack.
pub(crate) struct Worker {
    channel: Channel,
    core_id: u16,
    prefetch_distance: u16,
    /// Owner-only; touched exclusively inside the optimistic read cycle.
    task_stack: UnsafeCell<TaskStack>,
}

// The channel carries its own sharing contracts; the task stack is
// owner-only.
unsafe impl Send for Worker {}
unsafe impl Sync for Worker {}

impl Worker {
    pub(crate) fn new(
        channel_id: u16,
        core_id: u16,
        numa_node_id: u8,
        prefetch_distance: u16,
    ) -> Self {
        Self {
            channel: Channel::new(channel_id, numa_node_id, prefetch_distance),
            core_id,
            prefetch_distance,
            task_stack: UnsafeCell::new(TaskStack::new()),
        }
    }

    pub(crate) fn core_id(&self) -> u16 {
        self.core_id
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The worker thread's entry point. Returns when the running flag
    /// drops and the ready buffer is drained.
    ///
    /// # Safety
    /// Must be called at most once, on the thread dedicated to this worker.
    pub(crate) unsafe fn run(&self, ctx: &WorkerContext<'_>) {
        if !platform::pin_current_thread(self.core_id) {
            tracing::warn!(core_id = self.core_id, "worker could not pin its thread");
        }

        while !ctx.is_running.load(Ordering::Acquire) {
            platform::pause();
        }

        let core_id = self.core_id;
        let channel_id = self.channel.id();
        let periodic = ctx.reclamation == MemoryReclamation::Periodic;
        let mut channel_size: i32;

        while ctx.is_running.load(Ordering::Acquire) {
            if periodic {
                ctx.epochs
                    .local_epoch(channel_id)
                    .enter(ctx.epochs.global_epoch());
            }

            channel_size = unsafe { self.channel.fill() } as i32;
            ctx.statistics.increment(Counter::Fill, channel_id);

            loop {
                let task = unsafe { self.channel.next() };
                if task.is_null() {
                    break;
                }

                // Keep the buffer ahead of the prefetch pipeline. Once the
                // runtime is interrupted, only the buffered tasks finish.
                channel_size -= 1;
                if channel_size <= self.prefetch_distance as i32
                    && ctx.is_running.load(Ordering::Acquire)
                {
                    if periodic {
                        ctx.epochs
                            .local_epoch(channel_id)
                            .enter(ctx.epochs.global_epoch());
                    }
                    channel_size = unsafe { self.channel.fill() } as i32;
                    ctx.statistics.increment(Counter::Fill, channel_id);
                }

                ctx.statistics.increment(Counter::Executed, channel_id);
                let annotation = unsafe { &(*task).annotation };
                if annotation.has_resource() {
                    if annotation.is_readonly() {
                        ctx.statistics.increment(Counter::ExecutedReader, channel_id);
                    } else {
                        ctx.statistics.increment(Counter::ExecutedWriter, channel_id);
                    }
                }

                let result = unsafe { self.dispatch(task, core_id, channel_id, ctx) };
                unsafe { self.apply_result(task, result, core_id, channel_id, ctx) };
            }
        }
    }

    /// Choose the execution context from the resource's primitive.
    unsafe fn dispatch(
        &self,
        task: *mut RawTask,
        core_id: u16,
        channel_id: u16,
        ctx: &WorkerContext<'_>,
    ) -> TaskResult {
        let annotation = unsafe { &(*task).annotation };
        let Some((resource, _)) = annotation.resource() else {
            return unsafe { RawTask::execute(task, core_id, channel_id) };
        };

        match resource.primitive() {
            // ScheduleAll is correct bare because the scheduler routed every
            // access to the home channel.
            Primitive::None | Primitive::ScheduleAll => unsafe {
                RawTask::execute(task, core_id, channel_id)
            },
            Primitive::ExclusiveLatch => unsafe {
                let latch = resource.header().exclusive_latch();
                latch.lock();
                let result = RawTask::execute(task, core_id, channel_id);
                latch.unlock();
                result
            },
            Primitive::ReaderWriterLatch => unsafe {
                let latch = resource.header().rw_latch();
                if annotation.is_readonly() {
                    latch.lock_shared();
                    let result = RawTask::execute(task, core_id, channel_id);
                    latch.unlock_shared();
                    result
                } else {
                    latch.lock();
                    let result = RawTask::execute(task, core_id, channel_id);
                    latch.unlock();
                    result
                }
            },
            Primitive::ScheduleWriter => unsafe {
                self.execute_single_writer_optimistic(task, resource, core_id, channel_id, ctx)
            },
            Primitive::Olfit => unsafe {
                self.execute_olfit(task, resource, core_id, channel_id, ctx)
            },
        }
    }

    /// `ScheduleWriter`: writers are serialized on the home channel, so the
    /// version is bumped without a compare-exchange. Readers on the home
    /// channel need no synchronization at all; readers elsewhere validate.
    unsafe fn execute_single_writer_optimistic(
        &self,
        task: *mut RawTask,
        resource: ResourcePtr,
        core_id: u16,
        channel_id: u16,
        ctx: &WorkerContext<'_>,
    ) -> TaskResult {
        unsafe {
            if (*task).annotation.is_readonly() {
                if resource.channel_id() != channel_id {
                    return self.execute_optimistic_read(task, resource, core_id, channel_id, ctx);
                }
                // On the home channel no write can interleave.
                return RawTask::execute(task, core_id, channel_id);
            }

            let latch = resource.header().optimistic_latch();
            latch.lock_single_writer();
            let result = RawTask::execute(task, core_id, channel_id);
            latch.unlock();
            result
        }
    }

    /// `OLFIT`: writers may run on any channel and must win the version
    /// word by compare-exchange; readers validate.
    unsafe fn execute_olfit(
        &self,
        task: *mut RawTask,
        resource: ResourcePtr,
        core_id: u16,
        channel_id: u16,
        ctx: &WorkerContext<'_>,
    ) -> TaskResult {
        unsafe {
            if (*task).annotation.is_readonly() {
                return self.execute_optimistic_read(task, resource, core_id, channel_id, ctx);
            }

            let latch = resource.header().optimistic_latch();
            latch.lock();
            let result = RawTask::execute(task, core_id, channel_id);
            latch.unlock();
            result
        }
    }

    /// The optimistic read cycle: save the task, snapshot the version, run,
    /// validate; on mismatch restore the task and retry.
    unsafe fn execute_optimistic_read(
        &self,
        task: *mut RawTask,
        resource: ResourcePtr,
        core_id: u16,
        channel_id: u16,
        ctx: &WorkerContext<'_>,
    ) -> TaskResult {
        let on_read = ctx.reclamation == MemoryReclamation::OnRead;
        if on_read {
            ctx.epochs
                .local_epoch(channel_id)
                .enter(ctx.epochs.global_epoch());
        }

        let task_stack = unsafe { &mut *self.task_stack.get() };
        task_stack.save(task);

        loop {
            unsafe {
                let header = resource.header();
                let version = header.version();
                let result = RawTask::execute(task, core_id, channel_id);

                if header.is_version_valid(version) {
                    if on_read {
                        ctx.epochs.local_epoch(channel_id).leave();
                    }
                    return result;
                }

                task_stack.restore(task);
            }
        }
    }

    /// Spawn the successor, remove the finished task, or both.
    unsafe fn apply_result(
        &self,
        task: *mut RawTask,
        result: TaskResult,
        core_id: u16,
        channel_id: u16,
        ctx: &WorkerContext<'_>,
    ) {
        match result.into_kind() {
            ResultKind::Null => {}
            ResultKind::Remove => unsafe {
                RawTask::drop_payload(task);
                ctx.task_allocator.free(core_id, task);
            },
            ResultKind::Succeed(successor) => unsafe {
                ctx.scheduler.schedule(successor, channel_id);
            },
            ResultKind::SucceedAndRemove(successor) => unsafe {
                ctx.scheduler.schedule(successor, channel_id);
                RawTask::drop_payload(task);
                ctx.task_allocator.free(core_id, task);
            },
            ResultKind::Repeat => unsafe {
                ctx.scheduler.schedule(TaskRef::from_raw(task), channel_id);
            },
            ResultKind::Stop => unsafe {
                let cell = ctx.task_allocator.allocate(core_id);
                let mut stop = RawTask::init_in_cell(
                    cell,
                    StopTask {
                        is_running: ctx.is_running as *const AtomicBool,
                    },
                );
                stop.annotate_channel(0);
                ctx.scheduler.schedule(stop, channel_id);
            },
        }
    }
}
