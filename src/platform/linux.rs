//! Linux implementation: mmap-backed allocation bound with `mbind`,
//! `sched_setaffinity`-based pinning.

use core::ffi::{c_int, c_long, c_ulong, c_void};

const PROT_READ: c_int = 0x1;
const PROT_WRITE: c_int = 0x2;
const MAP_PRIVATE: c_int = 0x02;
const MAP_ANONYMOUS: c_int = 0x20;
const MAP_NORESERVE: c_int = 0x4000;
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;

// MPOL_PREFERRED keeps the allocation usable when the node is full.
const MPOL_PREFERRED: c_int = 1;

#[cfg(target_arch = "x86_64")]
const SYS_MBIND: c_long = 237;
#[cfg(target_arch = "aarch64")]
const SYS_MBIND: c_long = 235;

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: i64,
    ) -> *mut c_void;

    fn munmap(addr: *mut c_void, length: usize) -> c_int;

    fn syscall(number: c_long, ...) -> c_long;

    fn sched_getcpu() -> c_int;

    fn sched_setaffinity(pid: c_int, cpusetsize: usize, mask: *const c_ulong) -> c_int;
}

pub unsafe fn node_alloc(node: u8, size: usize) -> *mut u8 {
    let ptr = unsafe {
        mmap(
            core::ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        return core::ptr::null_mut();
    }

    // Bind the pages to the requested node. Failure (no NUMA, bad node) is
    // tolerated; the mapping itself stays valid.
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    {
        let nodemask: c_ulong = 1 << (node as u32 % c_ulong::BITS);
        // The kernel reads ceil(max_node / 64) words from the mask; keep it
        // within the single word above.
        let max_node: c_ulong = c_ulong::BITS as c_ulong;
        unsafe {
            syscall(
                SYS_MBIND,
                ptr,
                size,
                MPOL_PREFERRED,
                &nodemask as *const c_ulong,
                max_node,
                0 as c_ulong,
            );
        }
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    let _ = node;

    ptr as *mut u8
}

pub unsafe fn node_dealloc(ptr: *mut u8, size: usize) {
    unsafe {
        munmap(ptr as *mut c_void, size);
    }
}

pub fn pin_current_thread(core_id: u16) -> bool {
    // cpu_set_t is 1024 bits on Linux.
    let mut mask = [0 as c_ulong; 1024 / c_ulong::BITS as usize];
    let bits = c_ulong::BITS as usize;
    let index = core_id as usize / bits;
    if index >= mask.len() {
        return false;
    }
    mask[index] = 1 << (core_id as usize % bits);
    unsafe { sched_setaffinity(0, size_of_val(&mask), mask.as_ptr()) == 0 }
}

pub fn current_core() -> u16 {
    let core = unsafe { sched_getcpu() };
    core.max(0) as u16
}
