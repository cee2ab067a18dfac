//! Portable fallback: node-blind allocation through the global allocator,
//! no pinning, no core probe.

use std::alloc::{Layout, alloc_zeroed, dealloc};

const PAGE_ALIGN: usize = 4096;

pub unsafe fn node_alloc(_node: u8, size: usize) -> *mut u8 {
    let Ok(layout) = Layout::from_size_align(size, PAGE_ALIGN) else {
        return core::ptr::null_mut();
    };
    unsafe { alloc_zeroed(layout) }
}

pub unsafe fn node_dealloc(ptr: *mut u8, size: usize) {
    let layout = Layout::from_size_align(size, PAGE_ALIGN).expect("layout mismatch on dealloc");
    unsafe { dealloc(ptr, layout) };
}

pub fn pin_current_thread(_core_id: u16) -> bool {
    false
}

pub fn current_core() -> u16 {
    0
}
