//! Epoch-based memory reclamation.
//!
//! Optimistic readers run without latches, so a deleted resource's memory
//! must stay mapped until every reader that might still touch it has moved
//! on. A dedicated thread ticks the global epoch on a fixed interval; each
//! worker publishes the epoch it observed before starting work (or the idle
//! sentinel). A logically deleted resource is stamped with the epoch of its
//! delete and physically reclaimed once every published local epoch has
//! passed that stamp.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::config::EPOCH_INTERVAL;
use crate::platform;
use crate::queue::{LocalQueue, MpscQueue};
use crate::resource::{EPOCH_INFINITY, ResourceHeader};
use crate::resource_alloc::DynamicAllocator;
use crate::task::{Task, TaskResult};

/// How workers publish their epochs. Chosen per runtime, not per resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryReclamation {
    /// No reclamation. Deleting optimistically synchronized resources is
    /// not safe in this mode.
    Disabled,
    /// Enter/leave an epoch around every optimistic read.
    OnRead,
    /// Enter an epoch on every buffer refill.
    #[default]
    Periodic,
}

impl MemoryReclamation {
    pub(crate) fn is_enabled(self) -> bool {
        self != Self::Disabled
    }
}

/// Epoch last observed by one worker. The sentinel means idle.
pub(crate) struct LocalEpoch {
    epoch: CachePadded<AtomicU64>,
}

impl LocalEpoch {
    fn new() -> Self {
        Self {
            epoch: CachePadded::new(AtomicU64::new(EPOCH_INFINITY)),
        }
    }

    /// Publish the current global epoch before touching shared state.
    #[inline]
    pub(crate) fn enter(&self, global_epoch: &AtomicU64) {
        self.epoch
            .store(global_epoch.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    /// Publish idleness.
    #[inline]
    pub(crate) fn leave(&self) {
        self.epoch.store(EPOCH_INFINITY, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn get(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

/// The reclamation service shared by all workers.
pub(crate) struct EpochManager {
    count_channels: u16,
    global_epoch: AtomicU64,
    local_epochs: Box<[LocalEpoch]>,
    /// Logically deleted resources, single consumer: the epoch thread.
    global_garbage: MpscQueue<ResourceHeader>,
    /// Per-channel garbage, single consumer: the owning worker. Only used
    /// with local garbage collection.
    local_garbage: Box<[CachePadded<MpscQueue<ResourceHeader>>]>,
    local_gc: bool,
}

impl EpochManager {
    pub(crate) fn new(count_channels: u16, local_gc: bool) -> Self {
        Self {
            count_channels,
            global_epoch: AtomicU64::new(0),
            local_epochs: (0..count_channels).map(|_| LocalEpoch::new()).collect(),
            global_garbage: MpscQueue::new(),
            local_garbage: (0..count_channels)
                .map(|_| CachePadded::new(MpscQueue::new()))
                .collect(),
            local_gc,
        }
    }

    pub(crate) fn global_epoch(&self) -> &AtomicU64 {
        &self.global_epoch
    }

    pub(crate) fn local_epoch(&self, channel_id: u16) -> &LocalEpoch {
        &self.local_epochs[channel_id as usize]
    }

    /// Smallest epoch any worker may still be reading in.
    pub(crate) fn min_local_epoch(&self) -> u64 {
        self.local_epochs
            .iter()
            .map(LocalEpoch::get)
            .min()
            .unwrap_or(EPOCH_INFINITY)
    }

    /// Stamp the resource with the current epoch and queue it for
    /// reclamation.
    ///
    /// # Safety
    /// `resource` must point to a live resource header that the runtime now
    /// owns exclusively (logically deleted, no new references handed out).
    pub(crate) unsafe fn add_to_garbage(&self, resource: *mut ResourceHeader, channel_id: u16) {
        unsafe {
            (*resource).set_remove_epoch(self.global_epoch.load(Ordering::SeqCst));
            if self.local_gc {
                self.local_garbage[channel_id as usize].push_back(resource);
            } else {
                self.global_garbage.push_back(resource);
            }
        }
    }

    /// Walk a garbage queue: reclaim what no reader can reach, requeue the
    /// rest for the next pass.
    ///
    /// # Safety
    /// The caller must be the queue's single consumer.
    unsafe fn reclaim_from(
        &self,
        queue: &MpscQueue<ResourceHeader>,
        allocator: &DynamicAllocator,
    ) {
        let min_epoch = self.min_local_epoch();
        let mut deferred: LocalQueue<ResourceHeader> = LocalQueue::new();

        unsafe {
            loop {
                let resource = queue.pop_front();
                if resource.is_null() {
                    break;
                }
                if (*resource).remove_epoch() < min_epoch {
                    reclaim(resource, allocator);
                } else {
                    deferred.push_back(resource);
                }
            }

            if !deferred.is_empty() {
                queue.push_back_chain(deferred.begin(), deferred.end());
            }
        }
    }

    /// Reclaim mature garbage from the global queue. Caller: epoch thread.
    pub(crate) unsafe fn reclaim_global_garbage(&self, allocator: &DynamicAllocator) {
        unsafe { self.reclaim_from(&self.global_garbage, allocator) };
    }

    /// Reclaim mature garbage of one channel. Caller: the owning worker.
    pub(crate) unsafe fn reclaim_channel_garbage(
        &self,
        channel_id: u16,
        allocator: &DynamicAllocator,
    ) {
        unsafe { self.reclaim_from(&self.local_garbage[channel_id as usize], allocator) };
    }

    /// Reclaim everything unconditionally. Called after all workers joined.
    pub(crate) unsafe fn reclaim_all(&self, allocator: &DynamicAllocator) {
        unsafe {
            loop {
                let resource = self.global_garbage.pop_front();
                if resource.is_null() {
                    break;
                }
                reclaim(resource, allocator);
            }
            for queue in self.local_garbage.iter() {
                loop {
                    let resource = queue.pop_front();
                    if resource.is_null() {
                        break;
                    }
                    reclaim(resource, allocator);
                }
            }
        }
    }

    /// Reset all epochs to their initial values. Only meaningful while no
    /// resource memory is in use.
    pub(crate) fn reset(&self, allocator: &DynamicAllocator) {
        if allocator.is_free() {
            self.global_epoch.store(0, Ordering::SeqCst);
            for local in self.local_epochs.iter() {
                local.leave();
            }
        }
    }

    /// The epoch thread's loop: tick the global epoch, collect garbage,
    /// sleep. `spawn_reclaim` schedules the per-channel reclaim task in
    /// local-GC mode.
    pub(crate) fn run_epoch_thread(
        &self,
        is_running: &AtomicBool,
        allocator: &DynamicAllocator,
        spawn_reclaim: &dyn Fn(u16),
    ) {
        while !is_running.load(Ordering::Acquire) {
            platform::pause();
        }

        while is_running.load(Ordering::Acquire) {
            self.global_epoch.fetch_add(1, Ordering::SeqCst);

            if self.local_gc {
                for channel_id in 0..self.count_channels {
                    spawn_reclaim(channel_id);
                }
            } else {
                unsafe { self.reclaim_global_garbage(allocator) };
            }

            std::thread::sleep(EPOCH_INTERVAL);
        }
    }
}

/// Drop the resource and give its memory back.
unsafe fn reclaim(resource: *mut ResourceHeader, allocator: &DynamicAllocator) {
    unsafe {
        if let Some(drop_fn) = (*resource).reclaim {
            drop_fn(resource);
        }
        allocator.free(resource as *mut u8);
    }
}

/// Drains one channel's garbage queue on that channel. One long-lived task
/// per channel, re-spawned by the epoch thread on every tick when local
/// garbage collection is enabled; the idle flag keeps a slow channel from
/// being handed the same task twice.
pub(crate) struct ReclaimGarbageTask {
    pub(crate) epochs: *const EpochManager,
    pub(crate) allocator: *const DynamicAllocator,
    pub(crate) idle: *const AtomicBool,
}

// The raw pointers target runtime-owned state that outlives all workers.
unsafe impl Send for ReclaimGarbageTask {}

impl Task for ReclaimGarbageTask {
    fn execute(&mut self, _core_id: u16, channel_id: u16) -> TaskResult {
        unsafe {
            (*self.epochs).reclaim_channel_garbage(channel_id, &*self.allocator);
            (*self.idle).store(true, Ordering::Release);
        }
        TaskResult::null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use core::sync::atomic::AtomicUsize;

    #[repr(C)]
    struct TestResource {
        header: ResourceHeader,
        drops: *const AtomicUsize,
    }

    unsafe impl Resource for TestResource {}

    impl Drop for TestResource {
        fn drop(&mut self) {
            unsafe { (*self.drops).fetch_add(1, Ordering::SeqCst) };
        }
    }

    unsafe fn drop_test_resource(header: *mut ResourceHeader) {
        unsafe { core::ptr::drop_in_place(header as *mut TestResource) };
    }

    fn build_resource(allocator: &DynamicAllocator, drops: &AtomicUsize) -> *mut ResourceHeader {
        let memory = allocator.allocate(0, 64, size_of::<TestResource>());
        let resource = memory as *mut TestResource;
        unsafe {
            resource.write(TestResource {
                header: ResourceHeader::new(),
                drops: drops as *const AtomicUsize,
            });
            (*(resource as *mut ResourceHeader)).reclaim = Some(drop_test_resource);
        }
        resource as *mut ResourceHeader
    }

    #[test]
    fn test_min_local_epoch_tracks_entries() {
        let manager = EpochManager::new(2, false);
        assert_eq!(manager.min_local_epoch(), EPOCH_INFINITY);

        manager.global_epoch().store(9, Ordering::SeqCst);
        manager.local_epoch(0).enter(manager.global_epoch());
        assert_eq!(manager.min_local_epoch(), 9);

        manager.global_epoch().store(12, Ordering::SeqCst);
        manager.local_epoch(1).enter(manager.global_epoch());
        assert_eq!(manager.min_local_epoch(), 9);

        manager.local_epoch(0).leave();
        assert_eq!(manager.min_local_epoch(), 12);
    }

    #[test]
    fn test_garbage_deferred_until_epoch_passes() {
        let allocator = DynamicAllocator::new();
        let manager = EpochManager::new(1, false);
        let drops = AtomicUsize::new(0);

        // A worker is reading in the current epoch.
        manager.global_epoch().store(5, Ordering::SeqCst);
        manager.local_epoch(0).enter(manager.global_epoch());

        let resource = build_resource(&allocator, &drops);
        unsafe {
            manager.add_to_garbage(resource, 0);
            manager.reclaim_global_garbage(&allocator);
        }
        // remove_epoch == local epoch: the reader might still be inside.
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert!(!allocator.is_free());

        // The worker advances past the delete epoch.
        manager.global_epoch().fetch_add(1, Ordering::SeqCst);
        manager.local_epoch(0).enter(manager.global_epoch());
        unsafe { manager.reclaim_global_garbage(&allocator) };

        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(allocator.is_free());
    }

    #[test]
    fn test_idle_workers_do_not_block_reclamation() {
        let allocator = DynamicAllocator::new();
        let manager = EpochManager::new(2, false);
        let drops = AtomicUsize::new(0);

        let resource = build_resource(&allocator, &drops);
        unsafe {
            manager.add_to_garbage(resource, 0);
            manager.reclaim_global_garbage(&allocator);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(allocator.is_free());
    }

    #[test]
    fn test_reclaim_all_ignores_epochs() {
        let allocator = DynamicAllocator::new();
        let manager = EpochManager::new(1, true);
        let drops = AtomicUsize::new(0);

        manager.global_epoch().store(3, Ordering::SeqCst);
        manager.local_epoch(0).enter(manager.global_epoch());

        let first = build_resource(&allocator, &drops);
        let second = build_resource(&allocator, &drops);
        unsafe {
            manager.add_to_garbage(first, 0);
            manager.add_to_garbage(second, 0);
            manager.reclaim_all(&allocator);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert!(allocator.is_free());
    }
}
