//! Resource construction, placement and destruction.
//!
//! Building a resource decides three things: the synchronization primitive
//! (from the hint, see the selection matrix), the home channel (hinted, or
//! round-robin with a step over channels already predicted to host an
//! excessively used resource), and the NUMA node (hinted, or the home
//! channel's node). The object is then constructed in place on that node
//! and handed out as a tagged pointer.

use core::sync::atomic::{AtomicU16, Ordering};

use crossbeam_utils::CachePadded;

use crate::primitive::{self, IsolationLevel};
use crate::resource::{Hint, Resource, ResourceHeader, ResourcePtr};
use crate::resource_alloc::DynamicAllocator;
use crate::scheduler::Scheduler;

pub(crate) struct Builder {
    /// Next channel for round-robin placement.
    round_robin_channel: CachePadded<AtomicU16>,
}

unsafe fn reclaim_thunk<T: Resource>(header: *mut ResourceHeader) {
    unsafe { core::ptr::drop_in_place(header as *mut T) };
}

impl Builder {
    pub(crate) fn new() -> Self {
        Self {
            round_robin_channel: CachePadded::new(AtomicU16::new(0)),
        }
    }

    /// Choose home channel and NUMA node for a resource.
    fn place(&self, scheduler: &Scheduler, hint: &Hint) -> (u16, u8) {
        if let Some(channel_id) = hint.hinted_channel() {
            scheduler.predict_usage(channel_id, hint.frequency());
            let node = hint
                .hinted_numa_node()
                .unwrap_or_else(|| scheduler.numa_node_id(channel_id));
            return (channel_id, node);
        }

        let count_channels = scheduler.count_channels();
        let mut channel_id =
            self.round_robin_channel.fetch_add(1, Ordering::Relaxed) % count_channels;

        // Do not co-locate a strictly exclusive resource with one that is
        // already predicted to monopolize its channel.
        if count_channels > 2
            && hint.isolation_level() == IsolationLevel::Exclusive
            && scheduler.has_excessive_usage_prediction(channel_id)
        {
            channel_id = self.round_robin_channel.fetch_add(1, Ordering::Relaxed) % count_channels;
        }
        scheduler.predict_usage(channel_id, hint.frequency());

        let node = hint
            .hinted_numa_node()
            .unwrap_or_else(|| scheduler.numa_node_id(channel_id));
        (channel_id, node)
    }

    /// Allocate `size` bytes on the placed node and construct `value` there.
    pub(crate) fn build<T: Resource>(
        &self,
        scheduler: &Scheduler,
        allocator: &DynamicAllocator,
        size: usize,
        hint: Hint,
        value: T,
    ) -> ResourcePtr {
        assert!(
            size >= size_of::<T>(),
            "resource size must cover the resource type"
        );

        let chosen = primitive::resolve(
            hint.isolation_level(),
            hint.preferred_protocol(),
            hint.frequency(),
            hint.ratio(),
        );
        let (channel_id, node) = self.place(scheduler, &hint);

        let memory = allocator.allocate(node, 64, size);
        unsafe {
            (memory as *mut T).write(value);
            (*(memory as *mut ResourceHeader)).reclaim = Some(reclaim_thunk::<T>);
        }

        ResourcePtr::new(memory, channel_id, chosen)
    }

    /// Tag an externally owned object as a resource. The object's storage
    /// stays with the caller; such a pointer must not be passed to
    /// `destroy`.
    pub(crate) fn wrap<T: Resource>(
        &self,
        scheduler: &Scheduler,
        object: *mut T,
        hint: Hint,
    ) -> ResourcePtr {
        let chosen = primitive::resolve(
            hint.isolation_level(),
            hint.preferred_protocol(),
            hint.frequency(),
            hint.ratio(),
        );
        let (channel_id, _) = self.place(scheduler, &hint);
        ResourcePtr::new(object as *mut u8, channel_id, chosen)
    }

    /// Destroy a built resource: optimistically synchronized resources go
    /// through epoch reclamation, the rest are dropped and freed at once.
    ///
    /// # Safety
    /// `resource` must come from [`build`](Self::build), be logically
    /// unreachable by new tasks, and not be destroyed twice.
    pub(crate) unsafe fn destroy(
        &self,
        scheduler: &Scheduler,
        allocator: &DynamicAllocator,
        resource: ResourcePtr,
        reclamation_enabled: bool,
    ) {
        if resource.is_null() {
            return;
        }

        let header = resource.as_ptr::<ResourceHeader>();
        if reclamation_enabled && resource.primitive().is_optimistic() {
            unsafe {
                scheduler
                    .epochs()
                    .add_to_garbage(header, resource.channel_id())
            };
            return;
        }

        unsafe {
            if let Some(drop_fn) = (*header).reclaim {
                drop_fn(header);
            }
            allocator.free(resource.as_ptr());
        }
    }
}
