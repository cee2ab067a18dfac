//! The scheduler: spawn routing over the worker set.
//!
//! Spawning a task picks a queue, nothing more. The decision prefers the
//! spawning worker's own (unsynchronized) local queue whenever the task is
//! allowed to execute where it is; everything else goes to the target
//! channel's MPSC queue for the producer's NUMA node. Writers of
//! channel-serialized resources always travel to the resource's home
//! channel, which is what makes their execution latch-free.

use core::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::CachePadded;

use crate::epoch::EpochManager;
use crate::primitive::Primitive;
use crate::resource::AccessFrequency;
use crate::stats::{Counter, Statistics};
use crate::task::TaskRef;
use crate::topology::CoreSet;
use crate::worker::Worker;

pub(crate) struct Scheduler {
    core_set: CoreSet,
    workers: Box<[Worker]>,
    is_running: CachePadded<AtomicBool>,
    epochs: EpochManager,
    statistics: Statistics,
}

impl Scheduler {
    pub(crate) fn new(core_set: CoreSet, prefetch_distance: u16, local_gc: bool) -> Self {
        let count_channels = core_set.len();
        let workers = (0..count_channels)
            .map(|channel_id| {
                Worker::new(
                    channel_id,
                    core_set.core(channel_id),
                    core_set.numa_node_id(channel_id),
                    prefetch_distance,
                )
            })
            .collect();

        Self {
            core_set,
            workers,
            is_running: CachePadded::new(AtomicBool::new(false)),
            epochs: EpochManager::new(count_channels, local_gc),
            statistics: Statistics::new(count_channels),
        }
    }

    pub(crate) fn count_channels(&self) -> u16 {
        self.workers.len() as u16
    }

    pub(crate) fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub(crate) fn numa_node_id(&self, channel_id: u16) -> u8 {
        self.core_set.numa_node_id(channel_id)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub(crate) fn running_flag(&self) -> &AtomicBool {
        &self.is_running
    }

    pub(crate) fn start(&self) {
        self.is_running.store(true, Ordering::Release);
    }

    /// Ask all workers to stop after their current buffer contents.
    pub(crate) fn interrupt(&self) {
        self.is_running.store(false, Ordering::Release);
    }

    pub(crate) fn epochs(&self) -> &EpochManager {
        &self.epochs
    }

    pub(crate) fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Clear statistics and epochs for a fresh run.
    pub(crate) fn reset(&self, allocator: &crate::resource_alloc::DynamicAllocator) {
        self.statistics.clear();
        self.epochs.reset(allocator);
    }

    pub(crate) fn predict_usage(&self, channel_id: u16, usage: AccessFrequency) {
        self.workers[channel_id as usize].channel().predict_usage(usage);
    }

    pub(crate) fn modify_predicted_usage(
        &self,
        channel_id: u16,
        old: AccessFrequency,
        new: AccessFrequency,
    ) {
        self.workers[channel_id as usize]
            .channel()
            .modify_predicted_usage(old, new);
    }

    pub(crate) fn has_excessive_usage_prediction(&self, channel_id: u16) -> bool {
        self.workers[channel_id as usize]
            .channel()
            .has_excessive_usage_prediction()
    }

    /// True when the task may stay on the spawning channel: it is already
    /// home, or it only reads and the primitive admits remote readers, or
    /// the primitive synchronizes without channel affinity.
    fn keep_task_local(
        is_readonly: bool,
        primitive: Primitive,
        resource_channel_id: u16,
        current_channel_id: u16,
    ) -> bool {
        resource_channel_id == current_channel_id
            || (is_readonly && primitive != Primitive::ScheduleAll)
            || (primitive != Primitive::None
                && primitive != Primitive::ScheduleAll
                && primitive != Primitive::ScheduleWriter)
    }

    /// Route a spawn from the worker owning `current_channel_id`.
    ///
    /// # Safety
    /// The caller must be the worker thread owning `current_channel_id`,
    /// or no worker may be running yet.
    pub(crate) unsafe fn schedule(&self, task: TaskRef, current_channel_id: u16) {
        let raw = task.into_raw();
        let annotation = unsafe { &(*raw).annotation };

        if let Some((resource, _)) = annotation.resource() {
            if Self::keep_task_local(
                annotation.is_readonly(),
                resource.primitive(),
                resource.channel_id(),
                current_channel_id,
            ) {
                unsafe {
                    self.workers[current_channel_id as usize]
                        .channel()
                        .push_local(raw)
                };
                self.statistics
                    .increment(Counter::ScheduledOnChannel, current_channel_id);
            } else {
                unsafe {
                    self.workers[resource.channel_id() as usize]
                        .channel()
                        .push_remote(raw, self.numa_node_id(current_channel_id))
                };
                self.statistics
                    .increment(Counter::ScheduledOffChannel, current_channel_id);
            }
        } else if let Some(target_channel_id) = annotation.channel() {
            if target_channel_id == current_channel_id {
                unsafe {
                    self.workers[current_channel_id as usize]
                        .channel()
                        .push_local(raw)
                };
                self.statistics
                    .increment(Counter::ScheduledOnChannel, current_channel_id);
            } else {
                unsafe {
                    self.workers[target_channel_id as usize]
                        .channel()
                        .push_remote(raw, self.numa_node_id(current_channel_id))
                };
                self.statistics
                    .increment(Counter::ScheduledOffChannel, current_channel_id);
            }
        } else if annotation.node().is_some() {
            panic!("node-annotated tasks are not schedulable; annotate a channel or a resource");
        } else {
            unsafe {
                self.workers[current_channel_id as usize]
                    .channel()
                    .push_local(raw)
            };
            self.statistics
                .increment(Counter::ScheduledOnChannel, current_channel_id);
        }

        self.statistics
            .increment(Counter::Scheduled, current_channel_id);
    }

    /// Route a spawn from outside the workers. The task must name its
    /// target through a resource or channel annotation.
    pub(crate) fn schedule_remote(&self, task: TaskRef) {
        let raw = task.into_raw();
        let annotation = unsafe { &(*raw).annotation };

        let target_channel_id = if let Some((resource, _)) = annotation.resource() {
            resource.channel_id()
        } else if let Some(channel_id) = annotation.channel() {
            channel_id
        } else if annotation.node().is_some() {
            panic!("node-annotated tasks are not schedulable; annotate a channel or a resource");
        } else {
            panic!("spawning from outside a worker requires a channel or resource annotation");
        };

        unsafe {
            self.workers[target_channel_id as usize]
                .channel()
                .push_remote(raw, 0)
        };
        self.statistics
            .increment(Counter::ScheduledOffChannel, target_channel_id);
        self.statistics
            .increment(Counter::Scheduled, target_channel_id);
    }
}
