//! Task and garbage queues.
//!
//! Three disciplines, each used in a specific slot of the runtime:
//!
//! - [`LocalQueue`]: intrusive FIFO with a single owner (a worker spawning
//!   to itself). No synchronization at all.
//! - [`MpscQueue`]: intrusive stub-node queue; any thread pushes with one
//!   `swap`, only the owning consumer pops. Used for cross-worker spawns and
//!   the epoch garbage lists.
//! - [`BoundedMpmcQueue`]: sequence-numbered ring for general utility
//!   traffic off the hot path.
//!
//! The intrusive queues chain nodes through a [`Link`] embedded at the start
//! of the node itself, so queue operations never allocate.

use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::platform;

/// Intrusive queue hook. Lives at offset 0 of every queueable object.
pub struct Link {
    next: AtomicPtr<Link>,
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

impl Link {
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Marker for types that can live in the intrusive queues.
///
/// # Safety
/// Implementors must be `#[repr(C)]` with a [`Link`] as their first field,
/// so that a pointer to the object is a pointer to its link.
pub unsafe trait Intrusive: Sized {}

#[inline]
fn link_of<T: Intrusive>(node: *mut T) -> *mut Link {
    node.cast()
}

/// Single-owner FIFO. Push and pop require exclusive access; the owner is
/// the only thread allowed to hold one.
pub struct LocalQueue<T: Intrusive> {
    head: *mut Link,
    tail: *mut Link,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T: Intrusive> Send for LocalQueue<T> {}

impl<T: Intrusive> Default for LocalQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Intrusive> LocalQueue<T> {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// First node of the chain (for draining into another queue).
    pub fn begin(&self) -> *mut T {
        self.head.cast()
    }

    /// Last node of the chain.
    pub fn end(&self) -> *mut T {
        self.tail.cast()
    }

    /// Append a node.
    ///
    /// # Safety
    /// `node` must point to a live object that is in no queue.
    pub unsafe fn push_back(&mut self, node: *mut T) {
        let link = link_of(node);
        unsafe { (*link).next.store(ptr::null_mut(), Ordering::Relaxed) };

        if self.tail.is_null() {
            self.head = link;
            self.tail = link;
        } else {
            unsafe { (*self.tail).next.store(link, Ordering::Relaxed) };
            self.tail = link;
        }
    }

    /// Detach and return the first node, or null when empty.
    ///
    /// # Safety
    /// All nodes previously pushed must still be live.
    pub unsafe fn pop_front(&mut self) -> *mut T {
        let head = self.head;
        if head.is_null() {
            return ptr::null_mut();
        }

        let next = unsafe { (*head).next.load(Ordering::Relaxed) };
        if next.is_null() {
            self.tail = ptr::null_mut();
        }
        self.head = next;
        head.cast()
    }
}

/// Multi-producer single-consumer intrusive queue with unbounded slots.
///
/// Producers enqueue with a single atomic exchange on the head and then link
/// the predecessor; the consumer walks the chain from the tail. A stub node
/// keeps the chain non-empty so producers never race the consumer over a
/// null head.
///
/// Progress guarantee: when a producer has swapped the head but not yet
/// written the predecessor's `next`, `pop_front` returns null instead of
/// observing the torn chain.
pub struct MpscQueue<T: Intrusive> {
    /// Swapped by every producer.
    head: CachePadded<AtomicPtr<Link>>,
    /// Advanced only by the consumer.
    tail: CachePadded<AtomicPtr<Link>>,
    /// Dummy node for the empty state. Boxed so the queue stays movable.
    stub: Box<Link>,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T: Intrusive> Send for MpscQueue<T> {}
unsafe impl<T: Intrusive> Sync for MpscQueue<T> {}

impl<T: Intrusive> Default for MpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Intrusive> MpscQueue<T> {
    pub fn new() -> Self {
        let stub = Box::new(Link::new());
        let stub_ptr = &*stub as *const Link as *mut Link;
        Self {
            head: CachePadded::new(AtomicPtr::new(stub_ptr)),
            tail: CachePadded::new(AtomicPtr::new(stub_ptr)),
            stub,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn stub_ptr(&self) -> *mut Link {
        &*self.stub as *const Link as *mut Link
    }

    /// True when no item is queued. Exact only from the consumer.
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Acquire) == self.stub_ptr()
            && self.stub.next.load(Ordering::Acquire).is_null()
    }

    /// Enqueue a node. Callable from any thread.
    ///
    /// # Safety
    /// `node` must point to a live object that is in no queue and stays
    /// live until popped.
    pub unsafe fn push_back(&self, node: *mut T) {
        unsafe { self.push_link(link_of(node)) };
    }

    /// Enqueue a pre-linked chain from `begin` to `end` in one exchange.
    ///
    /// # Safety
    /// The nodes from `begin` to `end` must form a chain linked through
    /// their `Link`s, be live, and be in no other queue.
    pub unsafe fn push_back_chain(&self, begin: *mut T, end: *mut T) {
        let begin = link_of(begin);
        let end = link_of(end);
        unsafe {
            (*end).next.store(ptr::null_mut(), Ordering::Relaxed);
            let prev = self.head.swap(end, Ordering::AcqRel);
            (*prev).next.store(begin, Ordering::Release);
        }
    }

    unsafe fn push_link(&self, link: *mut Link) {
        unsafe {
            (*link).next.store(ptr::null_mut(), Ordering::Relaxed);
            let prev = self.head.swap(link, Ordering::AcqRel);
            (*prev).next.store(link, Ordering::Release);
        }
    }

    /// Dequeue the oldest node, or null when the queue is empty or a
    /// producer is mid-push.
    ///
    /// # Safety
    /// Only the owning consumer may call this, and never concurrently with
    /// itself.
    pub unsafe fn pop_front(&self) -> *mut T {
        let stub = self.stub_ptr();
        let mut tail = self.tail.load(Ordering::Relaxed);
        let mut next = unsafe { (*tail).next.load(Ordering::Acquire) };

        if tail == stub {
            if next.is_null() {
                return ptr::null_mut();
            }
            // Skip the stub; it is re-pushed when the chain runs dry.
            self.tail.store(next, Ordering::Relaxed);
            tail = next;
            next = unsafe { (*next).next.load(Ordering::Acquire) };
        }

        if !next.is_null() {
            self.tail.store(next, Ordering::Relaxed);
            return tail.cast();
        }

        let head = self.head.load(Ordering::Acquire);
        if tail != head {
            // A producer swapped the head but has not linked `next` yet.
            return ptr::null_mut();
        }

        unsafe { self.push_link(stub) };

        next = unsafe { (*tail).next.load(Ordering::Acquire) };
        if !next.is_null() {
            self.tail.store(next, Ordering::Relaxed);
            return tail.cast();
        }

        ptr::null_mut()
    }
}

/// Bounded multi-producer multi-consumer ring.
///
/// Each slot carries a sequence number that encodes whether it is free for
/// the next push or holds a value for the next pop.
pub struct BoundedMpmcQueue<T> {
    slots: Box<[Slot<T>]>,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
}

struct Slot<T> {
    sequence: AtomicU64,
    value: core::cell::UnsafeCell<Option<T>>,
}

unsafe impl<T: Send> Send for BoundedMpmcQueue<T> {}
unsafe impl<T: Send> Sync for BoundedMpmcQueue<T> {}

impl<T> BoundedMpmcQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded queue needs at least one slot");
        let slots = (0..capacity)
            .map(|index| Slot {
                sequence: AtomicU64::new(index as u64),
                value: core::cell::UnsafeCell::new(None),
            })
            .collect();
        Self {
            slots,
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Insert, spinning until a slot is available.
    pub fn push_back(&self, item: T) {
        let mut item = item;
        loop {
            match self.try_push_back(item) {
                Ok(()) => return,
                Err(rejected) => item = rejected,
            }
            platform::pause();
        }
    }

    /// Remove the oldest item, spinning until one is available.
    pub fn pop_front(&self) -> T {
        loop {
            if let Some(item) = self.try_pop_front() {
                return item;
            }
            platform::pause();
        }
    }

    /// Try to insert; hands the item back when the queue is full.
    pub fn try_push_back(&self, item: T) -> Result<(), T> {
        let capacity = self.slots.len() as u64;
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos % capacity) as usize];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let difference = sequence as i64 - pos as i64;
            if difference == 0 {
                if self
                    .head
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    unsafe { *slot.value.get() = Some(item) };
                    slot.sequence.store(pos + 1, Ordering::Release);
                    return Ok(());
                }
                pos = self.head.load(Ordering::Relaxed);
            } else if difference < 0 {
                return Err(item);
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Try to remove the oldest item.
    pub fn try_pop_front(&self) -> Option<T> {
        let capacity = self.slots.len() as u64;
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos % capacity) as usize];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let difference = sequence as i64 - (pos + 1) as i64;
            if difference == 0 {
                if self
                    .tail
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let item = unsafe { (*slot.value.get()).take() };
                    slot.sequence.store(pos + capacity, Ordering::Release);
                    return item;
                }
                pos = self.tail.load(Ordering::Relaxed);
            } else if difference < 0 {
                return None;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }
}
