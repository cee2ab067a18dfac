//! Resources: memory objects the runtime places and synchronizes.
//!
//! A resource is referenced through a [`ResourcePtr`], a single word packing
//! the object address with its home channel and synchronization primitive.
//! Keeping both reachable without an indirection is what makes the
//! scheduler's keep-local test branch-free.
//!
//! Synchronized resources embed a [`ResourceHeader`] carrying the latches,
//! the optimistic version word and the epoch-reclamation hooks.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::primitive::Primitive;
use crate::queue::{Intrusive, Link};
use crate::sync::{OptimisticLock, RwSpinLock, SpinLock};

/// Expected access frequency of a resource, as hinted at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessFrequency {
    Excessive,
    High,
    #[default]
    Normal,
    Unused,
}

impl AccessFrequency {
    pub(crate) const COUNT: usize = 4;

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Excessive => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Unused => 3,
        }
    }
}

/// Expected read/write ratio of a resource, as hinted at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadWriteRatio {
    HeavyRead,
    MostlyRead,
    #[default]
    Balanced,
    MostlyWritten,
    HeavyWritten,
}

/// Placement and synchronization directives for resource creation. Every
/// field is optional; the default hint asks for nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hint {
    numa_node_id: Option<u8>,
    channel_id: Option<u16>,
    isolation: crate::primitive::IsolationLevel,
    protocol: crate::primitive::Protocol,
    access_frequency: AccessFrequency,
    read_write_ratio: ReadWriteRatio,
}

impl Hint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefer the given NUMA node for the allocation.
    pub fn numa_node(mut self, node_id: u8) -> Self {
        self.numa_node_id = Some(node_id);
        self
    }

    /// Pin the resource to an exact channel.
    pub fn channel(mut self, channel_id: u16) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn isolation(mut self, isolation: crate::primitive::IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn protocol(mut self, protocol: crate::primitive::Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn access_frequency(mut self, frequency: AccessFrequency) -> Self {
        self.access_frequency = frequency;
        self
    }

    pub fn read_write_ratio(mut self, ratio: ReadWriteRatio) -> Self {
        self.read_write_ratio = ratio;
        self
    }

    pub fn hinted_numa_node(&self) -> Option<u8> {
        self.numa_node_id
    }

    pub fn hinted_channel(&self) -> Option<u16> {
        self.channel_id
    }

    pub fn isolation_level(&self) -> crate::primitive::IsolationLevel {
        self.isolation
    }

    pub fn preferred_protocol(&self) -> crate::primitive::Protocol {
        self.protocol
    }

    pub fn frequency(&self) -> AccessFrequency {
        self.access_frequency
    }

    pub fn ratio(&self) -> ReadWriteRatio {
        self.read_write_ratio
    }
}

const ADDRESS_BITS: u32 = 48;
const ADDRESS_MASK: u64 = (1 << ADDRESS_BITS) - 1;
const CHANNEL_BITS: u32 = 12;
const CHANNEL_MASK: u64 = (1 << CHANNEL_BITS) - 1;
const PRIMITIVE_SHIFT: u32 = ADDRESS_BITS + CHANNEL_BITS;

/// Tagged pointer to a resource: low 48 bits are the object address, the
/// high 16 bits carry the home channel (12 bits) and the synchronization
/// primitive (4 bits).
///
/// The channel and primitive are assigned at construction and never change
/// for the resource's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ResourcePtr(u64);

impl ResourcePtr {
    pub const fn null() -> Self {
        Self(0)
    }

    pub(crate) fn new(address: *mut u8, channel_id: u16, primitive: Primitive) -> Self {
        let address = address as u64;
        debug_assert_eq!(address & !ADDRESS_MASK, 0, "address exceeds 48 bits");
        debug_assert_eq!(u64::from(channel_id) & !CHANNEL_MASK, 0);
        Self(
            (address & ADDRESS_MASK)
                | ((u64::from(channel_id) & CHANNEL_MASK) << ADDRESS_BITS)
                | ((primitive as u64) << PRIMITIVE_SHIFT),
        )
    }

    pub fn is_null(&self) -> bool {
        self.0 & ADDRESS_MASK == 0
    }

    /// Home channel of the resource.
    pub fn channel_id(&self) -> u16 {
        ((self.0 >> ADDRESS_BITS) & CHANNEL_MASK) as u16
    }

    /// Synchronization discipline of the resource.
    pub fn primitive(&self) -> Primitive {
        Primitive::from_tag((self.0 >> PRIMITIVE_SHIFT) as u8)
    }

    /// The object address with the tag stripped.
    pub fn as_ptr<T>(&self) -> *mut T {
        (self.0 & ADDRESS_MASK) as *mut T
    }

    /// The embedded header of a synchronized resource.
    ///
    /// # Safety
    /// The resource must embed a [`ResourceHeader`] as its first field
    /// (every [`Resource`] implementor does).
    pub(crate) unsafe fn header<'a>(&self) -> &'a ResourceHeader {
        unsafe { &*self.as_ptr::<ResourceHeader>() }
    }
}

impl core::fmt::Debug for ResourcePtr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResourcePtr")
            .field("address", &self.as_ptr::<u8>())
            .field("channel_id", &self.channel_id())
            .field("primitive", &self.primitive())
            .finish()
    }
}

/// Epoch value meaning "not removed yet" / "worker idle".
pub(crate) const EPOCH_INFINITY: u64 = u64::MAX;

/// Runtime state embedded in every synchronized resource.
///
/// Bundles the three synchronization primitives the worker's dispatch can
/// select, the epoch stamp of a logical delete and the intrusive link for
/// the garbage queue.
#[repr(C)]
pub struct ResourceHeader {
    /// Garbage-queue hook. Must stay the first field.
    link: Link,
    exclusive: SpinLock,
    rw: RwSpinLock,
    version: OptimisticLock,
    remove_epoch: AtomicU64,
    /// Drops the embedding object during epoch reclamation. Written once at
    /// construction, before the resource is shared.
    pub(crate) reclaim: Option<unsafe fn(*mut ResourceHeader)>,
}

unsafe impl Intrusive for ResourceHeader {}
unsafe impl Send for ResourceHeader {}
unsafe impl Sync for ResourceHeader {}

impl Default for ResourceHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceHeader {
    pub const fn new() -> Self {
        Self {
            link: Link::new(),
            exclusive: SpinLock::new(),
            rw: RwSpinLock::new(),
            version: OptimisticLock::new(),
            remove_epoch: AtomicU64::new(0),
            reclaim: None,
        }
    }

    pub(crate) fn exclusive_latch(&self) -> &SpinLock {
        &self.exclusive
    }

    pub(crate) fn rw_latch(&self) -> &RwSpinLock {
        &self.rw
    }

    pub(crate) fn optimistic_latch(&self) -> &OptimisticLock {
        &self.version
    }

    /// Current (unlocked) version of the resource.
    pub fn version(&self) -> u32 {
        self.version.read_valid()
    }

    /// True when the snapshot taken by [`version`](Self::version) is still
    /// current.
    pub fn is_version_valid(&self, version: u32) -> bool {
        self.version.is_valid(version)
    }

    pub(crate) fn set_remove_epoch(&self, epoch: u64) {
        self.remove_epoch.store(epoch, Ordering::SeqCst);
    }

    pub(crate) fn remove_epoch(&self) -> u64 {
        self.remove_epoch.load(Ordering::SeqCst)
    }
}

/// Types the runtime may synchronize and reclaim.
///
/// # Safety
/// Implementors must be `#[repr(C)]` with a [`ResourceHeader`] as their
/// first field, so the runtime can reach the header through the raw
/// resource address.
pub unsafe trait Resource {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::Primitive;

    #[test]
    fn test_tagged_ptr_roundtrip() {
        let mut value = 0u64;
        let address = &mut value as *mut u64 as *mut u8;

        let ptr = ResourcePtr::new(address, 0xABC, Primitive::Olfit);
        assert_eq!(ptr.as_ptr::<u64>(), address as *mut u64);
        assert_eq!(ptr.channel_id(), 0xABC);
        assert_eq!(ptr.primitive(), Primitive::Olfit);
        assert!(!ptr.is_null());
    }

    #[test]
    fn test_tagged_ptr_null() {
        let ptr = ResourcePtr::null();
        assert!(ptr.is_null());
        assert_eq!(ptr.channel_id(), 0);
        assert_eq!(ptr.primitive(), Primitive::None);
    }

    #[test]
    fn test_tagged_ptr_is_one_word() {
        assert_eq!(size_of::<ResourcePtr>(), size_of::<*mut u8>());
    }

    #[test]
    fn test_header_epoch_stamp() {
        let header = ResourceHeader::new();
        assert_eq!(header.remove_epoch(), 0);
        header.set_remove_epoch(42);
        assert_eq!(header.remove_epoch(), 42);
    }

    #[test]
    fn test_hint_builder() {
        let hint = Hint::new()
            .channel(3)
            .numa_node(1)
            .isolation(crate::primitive::IsolationLevel::Exclusive)
            .access_frequency(AccessFrequency::Excessive);
        assert_eq!(hint.hinted_channel(), Some(3));
        assert_eq!(hint.hinted_numa_node(), Some(1));
        assert_eq!(hint.frequency(), AccessFrequency::Excessive);
        assert_eq!(hint.ratio(), ReadWriteRatio::Balanced);
    }
}
