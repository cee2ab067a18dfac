//! Dynamic-size resource allocator.
//!
//! Memory for resources comes from per-NUMA-node allocation blocks. Each
//! block owns one mapped region and an address-ordered list of free ranges;
//! allocations are carved from the end of a fitting range (which is where
//! the requested alignment is cheapest), frees coalesce with both neighbors.
//! A header in front of every allocation records what `free` needs to find
//! its way back.
//!
//! Allocation within a block is serialized by the block's own lock;
//! operations on different blocks are independent. Growing a node is
//! serialized by a per-node flag so exactly one thread maps the new block
//! while the others spin.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::{MAX_NUMA_NODES, MIN_FREE_SPLIT, MIN_RESOURCE_BLOCK, RESOURCE_BLOCK_SIZE};
use crate::platform;
use crate::sync::SpinMutex;

/// Round `value` up to the next multiple of `base`.
pub(crate) fn next_multiple(value: usize, base: usize) -> usize {
    value.div_ceil(base) * base
}

/// A contiguous span of free bytes within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    start: usize,
    size: usize,
}

impl FreeRange {
    fn end(&self) -> usize {
        self.start + self.size
    }

    /// True when `other` begins exactly where this range ends.
    fn borders(&self, other: &FreeRange) -> bool {
        self.end() == other.start
    }
}

/// Header written immediately before every allocation.
#[repr(C)]
struct AllocatedHeader {
    /// Usable bytes following the header.
    size: usize,
    /// Alignment leftover folded into the allocation, sitting before the
    /// header.
    unused_before: u16,
    node: u8,
    block_id: u32,
}

const HEADER_SIZE: usize = size_of::<AllocatedHeader>();

struct BlockInner {
    free: Vec<FreeRange>,
    available: usize,
}

/// One mapped region plus its free list.
struct Block {
    id: u32,
    node: u8,
    size: usize,
    region: *mut u8,
    inner: SpinMutex<BlockInner>,
}

unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    fn new(id: u32, node: u8, size: usize) -> Self {
        let region = unsafe { platform::node_alloc(node, size) };
        assert!(
            !region.is_null(),
            "resource heap exhausted: cannot map {size} bytes on node {node}"
        );
        Self {
            id,
            node,
            size,
            region,
            inner: SpinMutex::new(BlockInner {
                free: vec![FreeRange {
                    start: region as usize,
                    size,
                }],
                available: size,
            }),
        }
    }

    /// Carve `size` bytes aligned to `alignment` out of this block, or
    /// return null when nothing fits.
    fn allocate(&self, alignment: usize, size: usize) -> *mut u8 {
        debug_assert!(alignment.is_power_of_two());

        let mut inner = self.inner.lock();
        if inner.available < size {
            return core::ptr::null_mut();
        }

        let Some((index, taken)) = Self::find_range(&inner.free, alignment, size) else {
            return core::ptr::null_mut();
        };

        let range = inner.free[index];
        let range_end = range.end();
        let remaining = range.size - taken;

        let (consumed, unused_before) = if remaining >= MIN_FREE_SPLIT {
            inner.free[index].size -= taken;
            (taken, 0u16)
        } else {
            // Too small to keep; fold the leftover into the allocation.
            inner.free.remove(index);
            (range.size, remaining as u16)
        };
        inner.available -= consumed;
        drop(inner);

        let header_address = range_end - taken;
        let header = header_address as *mut AllocatedHeader;
        unsafe {
            header.write(AllocatedHeader {
                size: taken - HEADER_SIZE,
                unused_before,
                node: self.node,
                block_id: self.id,
            });
        }
        debug_assert_eq!((header_address + HEADER_SIZE) % alignment, 0);

        (header_address + HEADER_SIZE) as *mut u8
    }

    /// Find a range that fits `size + header` with the allocation aligned
    /// when placed at the range's end. Returns the index and the total bytes
    /// to take.
    fn find_range(free: &[FreeRange], alignment: usize, size: usize) -> Option<(usize, usize)> {
        let size_with_header = size + HEADER_SIZE;

        for (index, range) in free.iter().enumerate() {
            if range.size < size_with_header {
                continue;
            }
            // Place the allocation at the end of the range and grow it
            // downward until its begin is aligned.
            let begin = range.end() - size;
            let aligned_size = size + (begin & (alignment - 1));
            let taken = aligned_size + HEADER_SIZE;
            if range.size >= taken {
                return Some((index, taken));
            }
        }
        None
    }

    /// Give an allocation back, coalescing with bordering free ranges.
    ///
    /// # Safety
    /// `header` must be the header of a live allocation from this block.
    unsafe fn free(&self, header: *mut AllocatedHeader) {
        let (start, size) = unsafe {
            let unused = usize::from((*header).unused_before);
            (
                header as usize - unused,
                (*header).size + unused + HEADER_SIZE,
            )
        };
        let range = FreeRange { start, size };

        let mut inner = self.inner.lock();
        let index = inner
            .free
            .partition_point(|existing| existing.start < range.start);

        if index < inner.free.len() && range.borders(&inner.free[index]) {
            // Merge with the right neighbor, then try to close the gap to
            // the left one.
            inner.free[index].start = range.start;
            inner.free[index].size += range.size;
            if index > 0 {
                let (left, right) = (inner.free[index - 1], inner.free[index]);
                if left.borders(&right) {
                    inner.free[index - 1].size += right.size;
                    inner.free.remove(index);
                }
            }
        } else if index > 0 && inner.free[index - 1].borders(&range) {
            inner.free[index - 1].size += range.size;
        } else {
            inner.free.insert(index, range);
        }
        inner.available += size;
    }

    /// True when one free range spans the whole block.
    fn is_free(&self) -> bool {
        let inner = self.inner.lock();
        inner.free.len() == 1 && inner.free[0].size == self.size
    }

    #[cfg(test)]
    fn free_ranges(&self) -> Vec<(usize, usize)> {
        self.inner
            .lock()
            .free
            .iter()
            .map(|range| (range.start, range.size))
            .collect()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe { platform::node_dealloc(self.region, self.size) };
    }
}

struct NodeBlocks {
    blocks: SpinMutex<Vec<Box<Block>>>,
    /// Held by the one thread growing this node.
    grow_flag: AtomicBool,
    next_id: AtomicU32,
}

impl NodeBlocks {
    fn new() -> Self {
        Self {
            blocks: SpinMutex::new(Vec::new()),
            grow_flag: AtomicBool::new(false),
            next_id: AtomicU32::new(0),
        }
    }
}

/// Allocator holding allocation blocks per NUMA node.
pub(crate) struct DynamicAllocator {
    nodes: [NodeBlocks; MAX_NUMA_NODES],
}

impl DynamicAllocator {
    pub(crate) fn new() -> Self {
        let mut allocator = Self {
            nodes: core::array::from_fn(|_| NodeBlocks::new()),
        };
        allocator.initialize_empty();
        allocator
    }

    /// Ensure every node has at least one block so the allocate fast path
    /// never checks for emptiness.
    pub(crate) fn initialize_empty(&mut self) {
        for (node, state) in self.nodes.iter_mut().enumerate() {
            if state.blocks.get_mut().is_empty() {
                let id = *state.next_id.get_mut();
                *state.next_id.get_mut() += 1;
                state
                    .blocks
                    .get_mut()
                    .push(Box::new(Block::new(id, node as u8, MIN_RESOURCE_BLOCK)));
            }
        }
    }

    /// Allocate `size` bytes aligned to `alignment` on the given node,
    /// growing the node when no block satisfies the request.
    pub(crate) fn allocate(&self, node: u8, alignment: usize, size: usize) -> *mut u8 {
        let node = (node as usize).min(MAX_NUMA_NODES - 1);
        let state = &self.nodes[node];

        loop {
            let block: *const Block = {
                let blocks = state.blocks.lock();
                &**blocks.last().expect("node without allocation block")
            };
            // The box behind `block` lives until `defragment`/drop, both of
            // which require exclusive access to the allocator.
            let memory = unsafe { (*block).allocate(alignment, size) };
            if !memory.is_null() {
                return memory;
            }

            self.grow(node as u8, alignment, size);
        }
    }

    /// Map a new block for the node; one thread grows, the rest wait.
    #[cold]
    fn grow(&self, node: u8, alignment: usize, size: usize) {
        let state = &self.nodes[node as usize];
        if state
            .grow_flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            // Room for the header and worst-case alignment slack.
            let needed = next_multiple(size + HEADER_SIZE + alignment, 64);
            let block_size = RESOURCE_BLOCK_SIZE.max(needed);
            let id = state.next_id.fetch_add(1, Ordering::AcqRel);

            let block = Box::new(Block::new(id, node, block_size));
            state.blocks.lock().push(block);

            state.grow_flag.store(false, Ordering::Release);
        } else {
            while state.grow_flag.load(Ordering::Acquire) {
                platform::pause();
            }
        }
    }

    /// Free an allocation returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// `pointer` must come from this allocator and not have been freed
    /// already.
    pub(crate) unsafe fn free(&self, pointer: *mut u8) {
        let header = unsafe { (pointer as *mut AllocatedHeader).sub(1) };
        let (node, block_id) = unsafe { ((*header).node, (*header).block_id) };

        let state = &self.nodes[(node as usize).min(MAX_NUMA_NODES - 1)];
        let block: *const Block = {
            let blocks = state.blocks.lock();
            let block = blocks
                .iter()
                .find(|block| block.id == block_id)
                .expect("allocation from unknown block");
            &**block
        };
        unsafe { (*block).free(header) };
    }

    /// Drop fully free blocks and rebuild the per-node minimum.
    pub(crate) fn defragment(&mut self) {
        for state in &mut self.nodes {
            state.blocks.get_mut().retain(|block| !block.is_free());
        }
        self.initialize_empty();
    }

    /// True when every block of every node is completely free.
    pub(crate) fn is_free(&self) -> bool {
        self.nodes
            .iter()
            .all(|state| state.blocks.lock().iter().all(|block| block.is_free()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_sorted_disjoint(block: &Block) {
        let ranges = block.free_ranges();
        for pair in ranges.windows(2) {
            let (left, right) = (pair[0], pair[1]);
            assert!(left.0 + left.1 < right.0, "ranges overlap or touch");
        }
    }

    #[test]
    fn test_allocate_aligned_and_free() {
        let allocator = DynamicAllocator::new();
        let pointer = allocator.allocate(0, 64, 1024);
        assert!(!pointer.is_null());
        assert_eq!(pointer as usize % 64, 0);

        unsafe {
            pointer.write_bytes(0xCD, 1024);
            allocator.free(pointer);
        }
        assert!(allocator.is_free());
    }

    #[test]
    fn test_coalesce_to_single_range() {
        let allocator = DynamicAllocator::new();

        let a = allocator.allocate(0, 64, 256);
        let b = allocator.allocate(0, 64, 256);
        let c = allocator.allocate(0, 64, 256);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        assert!(!allocator.is_free());

        unsafe {
            allocator.free(b);
            assert!(!allocator.is_free());
            allocator.free(a);
            allocator.free(c);
        }

        let blocks = allocator.nodes[0].blocks.lock();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].free_ranges().len(), 1);
        assert!(blocks[0].is_free());
    }

    #[test]
    fn test_free_list_stays_sorted() {
        let allocator = DynamicAllocator::new();
        let pointers: Vec<*mut u8> = (0..16).map(|_| allocator.allocate(0, 64, 512)).collect();

        // Free every other allocation to fragment, then check ordering.
        for pointer in pointers.iter().step_by(2) {
            unsafe { allocator.free(*pointer) };
        }
        {
            let blocks = allocator.nodes[0].blocks.lock();
            assert_sorted_disjoint(&blocks[0]);
        }
        for pointer in pointers.iter().skip(1).step_by(2) {
            unsafe { allocator.free(*pointer) };
        }
        assert!(allocator.is_free());
    }

    #[test]
    fn test_growth_on_oversized_request() {
        let mut allocator = DynamicAllocator::new();
        // Larger than the initial block, so a new block must be mapped.
        let size = MIN_RESOURCE_BLOCK + 4096;
        let pointer = allocator.allocate(0, 64, size);
        assert!(!pointer.is_null());
        {
            let blocks = allocator.nodes[0].blocks.lock();
            assert!(blocks.len() >= 2);
        }

        unsafe { allocator.free(pointer) };
        assert!(allocator.is_free());

        allocator.defragment();
        let blocks = allocator.nodes[0].blocks.lock();
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn test_small_leftover_folds_into_allocation() {
        let allocator = DynamicAllocator::new();
        // Carve the block down until a leftover smaller than the split
        // minimum shows up; the allocator must never leave a dust range.
        let pointers: Vec<*mut u8> = (0..64).map(|_| allocator.allocate(0, 64, 192)).collect();
        {
            let blocks = allocator.nodes[0].blocks.lock();
            for (_, size) in blocks[0].free_ranges() {
                assert!(size >= MIN_FREE_SPLIT);
            }
        }
        for pointer in pointers {
            unsafe { allocator.free(pointer) };
        }
        assert!(allocator.is_free());
    }
}
