//! Fixed-size task allocator.
//!
//! Two tiers, partitioned by the hardware:
//!
//! - One [`ChunkPool`] per NUMA node buffers large chunks from the OS. A
//!   chunk is handed out with a single atomic bump; when the buffer runs
//!   dry, one thread wins the refill flag and remaps a fresh batch while the
//!   losers spin.
//! - One [`CoreHeap`] per worker core cuts chunks into task cells and keeps
//!   them on an intrusive LIFO free list. Freeing pushes to the front, so
//!   the next allocation reuses the cell that is still hot in cache.
//!
//! The core tier is latch-free because each heap has exactly one owner; the
//! `unsafe fn`s carry that contract.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::config::{TASK_CHUNK_SIZE, TASK_CHUNKS_PER_REFILL, TASK_SIZE};
use crate::platform;
use crate::sync::SpinMutex;
use crate::task::RawTask;
use crate::topology::{self, CoreSet};

/// A free task cell, chained through its own first word.
#[repr(C)]
struct FreeCell {
    next: *mut FreeCell,
}

const _: () = assert!(TASK_SIZE >= size_of::<FreeCell>());

/// Per-NUMA-node chunk buffer over the OS heap.
struct ChunkPool {
    node: u8,
    /// Buffered chunk addresses, republished on refill.
    chunks: [AtomicPtr<u8>; TASK_CHUNKS_PER_REFILL],
    /// Bump index into `chunks`.
    next_free: AtomicUsize,
    /// Held by the one thread refilling the buffer.
    refill_flag: AtomicBool,
    /// Mapped regions, returned to the OS on drop.
    regions: SpinMutex<Vec<*mut u8>>,
}

const REGION_SIZE: usize = TASK_CHUNK_SIZE * TASK_CHUNKS_PER_REFILL;

impl ChunkPool {
    fn new(node: u8) -> Self {
        let pool = Self {
            node,
            chunks: [const { AtomicPtr::new(ptr::null_mut()) }; TASK_CHUNKS_PER_REFILL],
            next_free: AtomicUsize::new(0),
            refill_flag: AtomicBool::new(false),
            regions: SpinMutex::new(Vec::with_capacity(16)),
        };
        pool.map_batch();
        pool
    }

    /// Take one chunk, refilling the buffer when it ran dry.
    fn allocate_chunk(&self) -> *mut u8 {
        loop {
            let index = self.next_free.fetch_add(1, Ordering::AcqRel);
            if index < TASK_CHUNKS_PER_REFILL {
                return self.chunks[index].load(Ordering::Acquire);
            }

            if self
                .refill_flag
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.map_batch();
                self.refill_flag.store(false, Ordering::Release);
            } else {
                while self.refill_flag.load(Ordering::Acquire) {
                    platform::pause();
                }
            }
        }
    }

    /// Map one region and split it into buffered chunks.
    #[cold]
    fn map_batch(&self) {
        let region = unsafe { platform::node_alloc(self.node, REGION_SIZE) };
        assert!(
            !region.is_null(),
            "task heap exhausted: cannot map {REGION_SIZE} bytes on node {}",
            self.node
        );
        self.regions.lock().push(region);

        for (index, slot) in self.chunks.iter().enumerate() {
            slot.store(
                unsafe { region.add(index * TASK_CHUNK_SIZE) },
                Ordering::Release,
            );
        }
        self.next_free.store(0, Ordering::Release);
    }
}

impl Drop for ChunkPool {
    fn drop(&mut self) {
        for region in self.regions.get_mut().drain(..) {
            unsafe { platform::node_dealloc(region, REGION_SIZE) };
        }
    }
}

/// Per-core free list of task cells. Single owner, no synchronization.
struct CoreHeap {
    /// Index of the owning node's pool.
    node: u8,
    first: *mut FreeCell,
}

impl CoreHeap {
    fn new(node: u8) -> Self {
        Self {
            node,
            first: ptr::null_mut(),
        }
    }

    unsafe fn allocate(&mut self, pool: &ChunkPool) -> *mut RawTask {
        if self.first.is_null() {
            self.fill(pool);
        }
        let cell = self.first;
        self.first = unsafe { (*cell).next };
        cell.cast()
    }

    unsafe fn free(&mut self, task: *mut RawTask) {
        let cell = task.cast::<FreeCell>();
        unsafe { (*cell).next = self.first };
        self.first = cell;
    }

    /// Cut a fresh chunk into cells and chain them.
    #[cold]
    fn fill(&mut self, pool: &ChunkPool) {
        let chunk = pool.allocate_chunk();
        let count = TASK_CHUNK_SIZE / TASK_SIZE;

        for index in 0..count {
            let cell = unsafe { chunk.add(index * TASK_SIZE) }.cast::<FreeCell>();
            let next = if index + 1 < count {
                unsafe { chunk.add((index + 1) * TASK_SIZE) }.cast::<FreeCell>()
            } else {
                ptr::null_mut()
            };
            unsafe { (*cell).next = next };
        }
        self.first = chunk.cast();
    }
}

/// The fixed-size allocator over all cores of a core set.
pub(crate) struct FixedTaskAllocator {
    pools: [Option<Box<ChunkPool>>; crate::config::MAX_NUMA_NODES],
    /// Indexed by core id; `None` for cores outside the core set.
    heaps: Box<[Option<UnsafeCell<CoreHeap>>]>,
}

unsafe impl Send for FixedTaskAllocator {}
unsafe impl Sync for FixedTaskAllocator {}

impl FixedTaskAllocator {
    pub(crate) fn new(core_set: &CoreSet) -> Self {
        let mut pools: [Option<Box<ChunkPool>>; crate::config::MAX_NUMA_NODES] =
            [const { None }; crate::config::MAX_NUMA_NODES];

        let max_core = core_set.iter().max().unwrap_or(0) as usize;
        let mut heaps: Vec<Option<UnsafeCell<CoreHeap>>> = Vec::with_capacity(max_core + 1);
        heaps.resize_with(max_core + 1, || None);

        for core_id in core_set.iter() {
            let node = topology::node_id(core_id);
            let pool = pools[node as usize].get_or_insert_with(|| Box::new(ChunkPool::new(node)));

            let mut heap = CoreHeap::new(node);
            heap.fill(pool);
            heaps[core_id as usize] = Some(UnsafeCell::new(heap));
        }

        Self {
            pools,
            heaps: heaps.into_boxed_slice(),
        }
    }

    #[inline]
    fn heap(&self, core_id: u16) -> *mut CoreHeap {
        self.heaps
            .get(core_id as usize)
            .and_then(|slot| slot.as_ref())
            .unwrap_or_else(|| panic!("core {core_id} is not part of the runtime's core set"))
            .get()
    }

    /// Allocate one task cell from the given core's heap.
    ///
    /// # Safety
    /// No other thread may operate on `core_id`'s heap concurrently.
    pub(crate) unsafe fn allocate(&self, core_id: u16) -> *mut RawTask {
        let heap = self.heap(core_id);
        let node = unsafe { (*heap).node };
        let pool = self.pools[node as usize]
            .as_deref()
            .expect("core heap without node pool");
        unsafe { (*heap).allocate(pool) }
    }

    /// Return a task cell to the given core's heap. The cell need not have
    /// been allocated on that core.
    ///
    /// # Safety
    /// `task` must come from this allocator and be unreachable by the
    /// runtime; no other thread may operate on `core_id`'s heap
    /// concurrently.
    pub(crate) unsafe fn free(&self, core_id: u16, task: *mut RawTask) {
        unsafe { (*self.heap(core_id)).free(task) };
    }
}

/// Task allocation backend: the NUMA-partitioned slab or the system heap.
pub(crate) enum TaskAllocator {
    Fixed(FixedTaskAllocator),
    System,
}

impl TaskAllocator {
    pub(crate) fn new(core_set: &CoreSet, use_system_allocator: bool) -> Self {
        if use_system_allocator {
            Self::System
        } else {
            Self::Fixed(FixedTaskAllocator::new(core_set))
        }
    }

    /// # Safety
    /// See [`FixedTaskAllocator::allocate`]; the system variant is safe from
    /// any thread.
    pub(crate) unsafe fn allocate(&self, core_id: u16) -> *mut RawTask {
        match self {
            Self::Fixed(fixed) => unsafe { fixed.allocate(core_id) },
            Self::System => {
                let layout = cell_layout();
                let cell = unsafe { std::alloc::alloc(layout) };
                assert!(!cell.is_null(), "system allocator returned null");
                cell.cast()
            }
        }
    }

    /// # Safety
    /// `task` must have been allocated by this allocator; see
    /// [`FixedTaskAllocator::free`].
    pub(crate) unsafe fn free(&self, core_id: u16, task: *mut RawTask) {
        match self {
            Self::Fixed(fixed) => unsafe { fixed.free(core_id, task) },
            Self::System => unsafe { std::alloc::dealloc(task.cast(), cell_layout()) },
        }
    }
}

fn cell_layout() -> std::alloc::Layout {
    std::alloc::Layout::from_size_align(TASK_SIZE, 64).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Order;

    fn single_core_set() -> CoreSet {
        CoreSet::build(1, Order::Ascending)
    }

    #[test]
    fn test_allocate_aligned() {
        let allocator = FixedTaskAllocator::new(&single_core_set());
        unsafe {
            let task = allocator.allocate(0);
            assert!(!task.is_null());
            assert_eq!(task as usize % 64, 0);
            allocator.free(0, task);
        }
    }

    #[test]
    fn test_lifo_reuse() {
        let allocator = FixedTaskAllocator::new(&single_core_set());
        unsafe {
            let first = allocator.allocate(0);
            let second = allocator.allocate(0);
            assert_ne!(first, second);

            allocator.free(0, first);
            // The most recently freed cell comes back first.
            assert_eq!(allocator.allocate(0), first);

            allocator.free(0, second);
            allocator.free(0, first);
            assert_eq!(allocator.allocate(0), first);
            assert_eq!(allocator.allocate(0), second);
        }
    }

    #[test]
    fn test_many_allocations_distinct() {
        let allocator = FixedTaskAllocator::new(&single_core_set());
        unsafe {
            let mut cells: Vec<*mut RawTask> = (0..10_000).map(|_| allocator.allocate(0)).collect();
            cells.sort();
            cells.dedup();
            assert_eq!(cells.len(), 10_000);
            for cell in cells {
                allocator.free(0, cell);
            }
        }
    }

    #[test]
    #[should_panic(expected = "not part of the runtime's core set")]
    fn test_foreign_core_rejected() {
        let allocator = FixedTaskAllocator::new(&single_core_set());
        unsafe {
            allocator.allocate(77);
        }
    }

    #[test]
    fn test_system_backend_roundtrip() {
        let allocator = TaskAllocator::new(&single_core_set(), true);
        unsafe {
            let task = allocator.allocate(0);
            assert!(!task.is_null());
            assert_eq!(task as usize % 64, 0);
            allocator.free(0, task);
        }
    }
}
