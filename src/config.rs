//! Compile-time configuration of the runtime.
//!
//! Everything here is a constant so the hot structures (task cells, ready
//! buffers, counter lines) have fixed layouts. Run-time knobs live in
//! [`crate::runtime::RuntimeOptions`].

use core::time::Duration;

/// Maximum number of worker cores a runtime can be built over.
pub const MAX_CORES: usize = 128;

/// Maximum number of NUMA nodes the allocators partition over. Node ids
/// reported by the OS are clamped to this bound.
pub const MAX_NUMA_NODES: usize = 2;

/// Size of a single task cell in bytes. Tasks larger than
/// `TASK_SIZE - TASK_HEADER_SIZE` are rejected at monomorphization time.
#[cfg(not(feature = "wide-tasks"))]
pub const TASK_SIZE: usize = 64;
#[cfg(feature = "wide-tasks")]
pub const TASK_SIZE: usize = 128;

/// Bytes of every task cell occupied by the runtime header
/// (queue link, vtable, annotation).
pub const TASK_HEADER_SIZE: usize = 32;

/// Capacity of each worker's ready buffer. Power of two.
pub const TASK_BUFFER_SIZE: usize = 64;

/// Size of one chunk carved from the OS for task cells.
pub const TASK_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Number of chunks a node pool buffers per refill.
pub const TASK_CHUNKS_PER_REFILL: usize = 128;

/// Smallest block the dynamic resource allocator maps per node.
pub const MIN_RESOURCE_BLOCK: usize = 16 * 1024 * 1024;

/// Default block size when the dynamic allocator grows a node.
pub const RESOURCE_BLOCK_SIZE: usize = 256 * 1024 * 1024;

/// A free range shrinks in place only when at least this many bytes remain;
/// smaller leftovers are folded into the allocation as padding.
pub const MIN_FREE_SPLIT: usize = 256;

/// Cache line size assumed for alignment and padding.
pub const CACHE_LINE_SIZE: usize = 64;

/// Interval between global epoch increments.
pub const EPOCH_INTERVAL: Duration = Duration::from_millis(50);

const _: () = assert!(TASK_BUFFER_SIZE.is_power_of_two());
const _: () = assert!(TASK_SIZE > TASK_HEADER_SIZE);
