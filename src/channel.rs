//! The channel: one worker's view of scheduled tasks.
//!
//! Every worker owns exactly one channel. Tasks arrive either through the
//! single-owner local queue (the worker spawning to itself) or through one
//! of the MPSC queues, which are keyed by the producer's NUMA node so
//! producers on different nodes never share a queue. The worker drains the
//! queues into the prefetching ready buffer and executes from there.
//!
//! The channel also tracks usage predictions of the resources that were
//! placed on it; the builder consults these when spreading resources over
//! channels.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::config::{MAX_NUMA_NODES, TASK_BUFFER_SIZE};
use crate::queue::{LocalQueue, MpscQueue};
use crate::resource::AccessFrequency;
use crate::task::{Priority, RawTask};
use crate::task_buffer::TaskBuffer;

/// Counters of predicted resource usage per frequency class.
pub(crate) struct ChannelOccupancy {
    counters: [AtomicU64; AccessFrequency::COUNT],
}

impl ChannelOccupancy {
    fn new() -> Self {
        Self {
            counters: [const { AtomicU64::new(0) }; AccessFrequency::COUNT],
        }
    }

    pub(crate) fn predict(&self, usage: AccessFrequency) {
        self.counters[usage.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn revoke(&self, usage: AccessFrequency) {
        self.counters[usage.index()].fetch_sub(1, Ordering::Relaxed);
    }

    fn has_any(&self, usage: AccessFrequency) -> bool {
        self.counters[usage.index()].load(Ordering::Relaxed) > 0
    }

    pub(crate) fn has_excessive_usage_prediction(&self) -> bool {
        self.has_any(AccessFrequency::Excessive)
    }

    /// The highest predicted frequency class.
    #[cfg(test)]
    fn aggregated(&self) -> AccessFrequency {
        for usage in [
            AccessFrequency::Excessive,
            AccessFrequency::High,
            AccessFrequency::Normal,
        ] {
            if self.has_any(usage) {
                return usage;
            }
        }
        AccessFrequency::Unused
    }
}

/// Per-worker queue bundle and ready buffer.
pub(crate) struct Channel {
    id: u16,
    numa_node_id: u8,
    /// Thread-safe queues, one per priority per producer NUMA node.
    remote: [[MpscQueue<RawTask>; MAX_NUMA_NODES]; Priority::COUNT],
    /// Single-owner queues, one per priority.
    local: UnsafeCell<[LocalQueue<RawTask>; Priority::COUNT]>,
    /// Ready-to-execute tasks, owner only.
    buffer: UnsafeCell<TaskBuffer<TASK_BUFFER_SIZE>>,
    occupancy: CachePadded<ChannelOccupancy>,
}

// Shared access is limited to the MPSC queues and the occupancy counters;
// the UnsafeCell parts carry owner-only contracts on their accessors.
unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl Channel {
    pub(crate) fn new(id: u16, numa_node_id: u8, prefetch_distance: u16) -> Self {
        Self {
            id,
            numa_node_id,
            remote: core::array::from_fn(|_| core::array::from_fn(|_| MpscQueue::new())),
            local: UnsafeCell::new(core::array::from_fn(|_| LocalQueue::new())),
            buffer: UnsafeCell::new(TaskBuffer::new(prefetch_distance)),
            occupancy: CachePadded::new(ChannelOccupancy::new()),
        }
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    /// Enqueue from any thread. `producer_node` keys the MPSC queue.
    ///
    /// # Safety
    /// `task` must be a live task cell that is in no queue.
    pub(crate) unsafe fn push_remote(&self, task: *mut RawTask, producer_node: u8) {
        let priority = unsafe { (*task).annotation.priority() };
        let node = (producer_node as usize).min(MAX_NUMA_NODES - 1);
        unsafe { self.remote[priority.index()][node].push_back(task) };
    }

    /// Enqueue to the local queue.
    ///
    /// # Safety
    /// Only the owning worker may call this; `task` must be a live task
    /// cell that is in no queue.
    pub(crate) unsafe fn push_local(&self, task: *mut RawTask) {
        let priority = unsafe { (*task).annotation.priority() };
        unsafe { (*self.local.get())[priority.index()].push_back(task) };
    }

    /// Refill the ready buffer from the backend queues. Returns the buffer
    /// size after filling.
    ///
    /// Normal priority drains first; low priority only when nothing normal
    /// was ready.
    ///
    /// # Safety
    /// Only the owning worker may call this.
    pub(crate) unsafe fn fill(&self) -> u16 {
        let available = unsafe { (*self.buffer.get()).available_slots() };
        let mut size = unsafe { self.fill_priority(Priority::Normal, available) };
        if unsafe { (*self.buffer.get()).is_empty() } {
            size = unsafe { self.fill_priority(Priority::Low, TASK_BUFFER_SIZE as u16) };
        }
        size
    }

    unsafe fn fill_priority(&self, priority: Priority, available: u16) -> u16 {
        let buffer = unsafe { &mut *self.buffer.get() };
        let local = unsafe { &mut *self.local.get() };
        let mut available = available;

        // 1) The local queue.
        available -= buffer.fill(available, || unsafe {
            local[priority.index()].pop_front()
        });

        // 2) The remote queues, NUMA-local one first.
        if available > 0 {
            for offset in 0..MAX_NUMA_NODES {
                let node = (self.numa_node_id as usize + offset) % MAX_NUMA_NODES;
                let queue = &self.remote[priority.index()][node];
                available -= buffer.fill(available, || unsafe { queue.pop_front() });
            }
        }

        TASK_BUFFER_SIZE as u16 - available
    }

    /// Pop the next ready task, triggering its slot's prefetch record.
    ///
    /// # Safety
    /// Only the owning worker may call this.
    pub(crate) unsafe fn next(&self) -> *mut RawTask {
        unsafe { (*self.buffer.get()).next() }
    }

    /// True when the ready buffer is empty (backend queues may hold tasks).
    ///
    /// # Safety
    /// Only the owning worker may call this.
    pub(crate) unsafe fn buffer_is_empty(&self) -> bool {
        unsafe { (*self.buffer.get()).is_empty() }
    }

    /// Pop everything still queued or buffered into `discard`. Used for the
    /// shutdown sweep after the owning worker exited.
    ///
    /// # Safety
    /// No worker may be running.
    pub(crate) unsafe fn drain(&self, discard: &mut dyn FnMut(*mut RawTask)) {
        unsafe {
            loop {
                let task = (*self.buffer.get()).next();
                if task.is_null() {
                    break;
                }
                discard(task);
            }

            let local = &mut *self.local.get();
            for queue in local.iter_mut() {
                loop {
                    let task = queue.pop_front();
                    if task.is_null() {
                        break;
                    }
                    discard(task);
                }
            }

            for per_priority in &self.remote {
                for queue in per_priority {
                    loop {
                        let task = queue.pop_front();
                        if task.is_null() {
                            break;
                        }
                        discard(task);
                    }
                }
            }
        }
    }

    pub(crate) fn predict_usage(&self, usage: AccessFrequency) {
        self.occupancy.predict(usage);
    }

    pub(crate) fn modify_predicted_usage(&self, old: AccessFrequency, new: AccessFrequency) {
        self.occupancy.revoke(old);
        self.occupancy.predict(new);
    }

    #[cfg(test)]
    fn predicted_usage(&self) -> AccessFrequency {
        self.occupancy.aggregated()
    }

    pub(crate) fn has_excessive_usage_prediction(&self) -> bool {
        self.occupancy.has_excessive_usage_prediction()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskRef, TaskResult};

    struct Nop;

    impl Task for Nop {
        fn execute(&mut self, _: u16, _: u16) -> TaskResult {
            TaskResult::remove()
        }
    }

    fn make_task(priority: Priority) -> *mut RawTask {
        let layout = std::alloc::Layout::new::<RawTask>();
        let cell = unsafe { std::alloc::alloc(layout) as *mut RawTask };
        let mut task = unsafe { RawTask::init_in_cell(cell, Nop) };
        task.set_priority(priority);
        task.into_raw()
    }

    fn free_task(task: *mut RawTask) {
        let layout = std::alloc::Layout::new::<RawTask>();
        unsafe { std::alloc::dealloc(task as *mut u8, layout) };
    }

    #[test]
    fn test_local_before_remote() {
        let channel = Channel::new(0, 0, 0);
        let remote = make_task(Priority::Normal);
        let local = make_task(Priority::Normal);

        unsafe {
            channel.push_remote(remote, 0);
            channel.push_local(local);
            channel.fill();

            assert_eq!(channel.next(), local);
            assert_eq!(channel.next(), remote);
            assert!(channel.next().is_null());
        }

        free_task(remote);
        free_task(local);
    }

    #[test]
    fn test_normal_priority_before_low() {
        let channel = Channel::new(0, 0, 0);
        let low = make_task(Priority::Low);
        let normal = make_task(Priority::Normal);

        unsafe {
            channel.push_local(low);
            channel.push_local(normal);

            channel.fill();
            // Only the normal task entered the buffer.
            assert_eq!(channel.next(), normal);
            assert!(channel.next().is_null());

            channel.fill();
            assert_eq!(channel.next(), low);
        }

        free_task(low);
        free_task(normal);
    }

    #[test]
    fn test_fill_returns_buffer_size() {
        let channel = Channel::new(0, 0, 0);
        let tasks: Vec<_> = (0..5).map(|_| make_task(Priority::Normal)).collect();

        unsafe {
            for &task in &tasks {
                channel.push_remote(task, 1);
            }
            assert_eq!(channel.fill(), 5);
            assert!(!channel.buffer_is_empty());
        }

        for task in tasks {
            unsafe { assert_eq!(channel.next(), task) };
            free_task(task);
        }
    }

    #[test]
    fn test_occupancy_prediction() {
        let channel = Channel::new(0, 0, 0);
        assert_eq!(channel.predicted_usage(), AccessFrequency::Unused);
        assert!(!channel.has_excessive_usage_prediction());

        channel.predict_usage(AccessFrequency::Normal);
        assert_eq!(channel.predicted_usage(), AccessFrequency::Normal);

        channel.predict_usage(AccessFrequency::Excessive);
        assert!(channel.has_excessive_usage_prediction());
        assert_eq!(channel.predicted_usage(), AccessFrequency::Excessive);

        channel.modify_predicted_usage(AccessFrequency::Excessive, AccessFrequency::High);
        assert!(!channel.has_excessive_usage_prediction());
        assert_eq!(channel.predicted_usage(), AccessFrequency::High);
    }
}
