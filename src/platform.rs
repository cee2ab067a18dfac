//! OS abstraction for virtual memory and thread placement.
//!
//! Provides node-targeted page allocation (`node_alloc`/`node_dealloc`),
//! thread pinning and the current-core probe. On Linux the allocation is
//! bound to a NUMA node with `mbind`; elsewhere the node hint is ignored and
//! pinning is a no-op.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        use linux as imp;
    } else {
        mod fallback;
        use fallback as imp;
    }
}

/// Allocate `size` bytes of zeroed virtual memory, page-aligned, preferably
/// resident on NUMA node `node`. Returns null on failure.
///
/// The node binding is best effort: a kernel without NUMA support still
/// returns usable memory.
///
/// # Safety
/// Caller must eventually call `node_dealloc` with the returned pointer and
/// the same `size`.
#[inline]
pub unsafe fn node_alloc(node: u8, size: usize) -> *mut u8 {
    unsafe { imp::node_alloc(node, size) }
}

/// Free memory previously allocated by `node_alloc`.
///
/// # Safety
/// `ptr` must have been returned by `node_alloc` with the same `size`.
#[inline]
pub unsafe fn node_dealloc(ptr: *mut u8, size: usize) {
    unsafe { imp::node_dealloc(ptr, size) }
}

/// Pin the calling thread to the given logical core. Returns false when the
/// OS refused (the thread keeps running unpinned).
#[inline]
pub fn pin_current_thread(core_id: u16) -> bool {
    imp::pin_current_thread(core_id)
}

/// Logical core the calling thread currently runs on, or 0 when the OS
/// cannot tell.
#[inline]
pub fn current_core() -> u16 {
    imp::current_core()
}

/// Generate a pause/yield instruction while spinning.
#[inline(always)]
pub fn pause() {
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_alloc_zeroed() {
        unsafe {
            let size = 2 * 1024 * 1024;
            let ptr = node_alloc(0, size);
            assert!(!ptr.is_null());
            for offset in [0usize, 4095, size / 2, size - 1] {
                assert_eq!(*ptr.add(offset), 0);
            }
            *ptr = 0xAB;
            assert_eq!(*ptr, 0xAB);
            node_dealloc(ptr, size);
        }
    }

    #[test]
    fn test_pin_and_probe() {
        if pin_current_thread(0) {
            assert_eq!(current_core(), 0);
        }
    }
}
