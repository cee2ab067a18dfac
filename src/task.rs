//! The task: a bounded-size unit of work with a fixed execute contract.
//!
//! Concrete task types implement [`Task`] and are moved into fixed-size
//! cells ([`RawTask`]) owned by the task allocator. The cell header holds the
//! intrusive queue link, a monomorphized vtable and the annotation that
//! drives scheduling and prefetching; the payload is the task value itself.
//!
//! [`TaskRef`] is the owning handle handed to user code: annotate it, then
//! spawn it. Spawning consumes the handle; the runtime returns ownership to
//! the allocator when the task asks for removal.

use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

use crate::config::{TASK_HEADER_SIZE, TASK_SIZE};
use crate::queue::{Intrusive, Link};
use crate::resource::ResourcePtr;

/// Bytes available for the task value inside a cell.
pub const TASK_PAYLOAD_SIZE: usize = TASK_SIZE - TASK_HEADER_SIZE;

/// Run priority of a task. Low-priority tasks only run when no
/// normal-priority task is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
}

impl Priority {
    pub(crate) const COUNT: usize = 2;

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// What a task is annotated to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
enum TargetKind {
    #[default]
    None = 0,
    Resource = 1,
    Channel = 2,
    Node = 3,
}

/// Scheduling annotation packed into every task header.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct Annotation {
    resource: ResourcePtr,
    resource_size: u16,
    channel_or_node: u16,
    kind: TargetKind,
    priority: Priority,
    readonly: bool,
    /// Cell lives on the process heap (runtime-internal probes), not in the
    /// task allocator; the shutdown drain must leave it to its owner.
    heap_backed: bool,
}

impl Default for Annotation {
    fn default() -> Self {
        Self {
            resource: ResourcePtr::null(),
            resource_size: 0,
            channel_or_node: 0,
            kind: TargetKind::None,
            priority: Priority::Normal,
            readonly: false,
            heap_backed: false,
        }
    }
}

impl Annotation {
    #[inline]
    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    #[inline]
    pub(crate) fn is_readonly(&self) -> bool {
        self.readonly
    }

    #[inline]
    pub(crate) fn has_resource(&self) -> bool {
        self.kind == TargetKind::Resource
    }

    #[inline]
    pub(crate) fn resource(&self) -> Option<(ResourcePtr, u16)> {
        (self.kind == TargetKind::Resource).then_some((self.resource, self.resource_size))
    }

    #[inline]
    pub(crate) fn channel(&self) -> Option<u16> {
        (self.kind == TargetKind::Channel).then_some(self.channel_or_node)
    }

    #[inline]
    pub(crate) fn node(&self) -> Option<u8> {
        (self.kind == TargetKind::Node).then_some(self.channel_or_node as u8)
    }

    #[inline]
    pub(crate) fn is_heap_backed(&self) -> bool {
        self.heap_backed
    }
}

/// Tells the runtime what happens after a task ran.
pub struct TaskResult {
    kind: ResultKind,
}

pub(crate) enum ResultKind {
    /// Nothing; the task stays allocated (its owner keeps the cell).
    Null,
    /// Return the task's cell to the allocator.
    Remove,
    /// Spawn the given successor.
    Succeed(TaskRef),
    /// Spawn the given successor and remove the finished task.
    SucceedAndRemove(TaskRef),
    /// Re-spawn the finished task itself.
    Repeat,
    /// Spawn a stop task; the runtime winds down once it runs.
    Stop,
}

impl TaskResult {
    /// Nothing happens; ownership of the cell stays where it is.
    pub fn null() -> Self {
        Self {
            kind: ResultKind::Null,
        }
    }

    /// Remove the returning task after it finished.
    pub fn remove() -> Self {
        Self {
            kind: ResultKind::Remove,
        }
    }

    /// Run the given task as successor.
    pub fn succeed(successor: TaskRef) -> Self {
        Self {
            kind: ResultKind::Succeed(successor),
        }
    }

    /// Run the given task as successor and remove the returning task.
    pub fn succeed_and_remove(successor: TaskRef) -> Self {
        Self {
            kind: ResultKind::SucceedAndRemove(successor),
        }
    }

    /// Schedule the returning task again.
    pub fn repeat() -> Self {
        Self {
            kind: ResultKind::Repeat,
        }
    }

    /// Stop the whole runtime after the returning task.
    pub fn stop() -> Self {
        Self {
            kind: ResultKind::Stop,
        }
    }

    pub(crate) fn into_kind(self) -> ResultKind {
        self.kind
    }
}

/// The execution contract of every task.
///
/// `execute` runs to completion on the worker that popped the task; there is
/// no suspension inside a task. A task that is annotated read-only on an
/// optimistically synchronized resource may be executed, rolled back and
/// re-executed when a concurrent writer invalidated its read, so such a task
/// must confine its effects to its own state and the validated read.
pub trait Task: Send + 'static {
    /// Runs the task.
    ///
    /// `core_id` is the logical core executing the task, `channel_id` the
    /// executing worker's channel.
    fn execute(&mut self, core_id: u16, channel_id: u16) -> TaskResult;
}

/// Vtable of a concrete task type, monomorphized once per type.
pub(crate) struct TaskVTable {
    pub(crate) execute: unsafe fn(*mut RawTask, u16, u16) -> TaskResult,
    pub(crate) drop_payload: unsafe fn(*mut RawTask),
}

trait HasVTable: Task + Sized {
    const VTABLE: TaskVTable = TaskVTable {
        execute: execute_thunk::<Self>,
        drop_payload: drop_thunk::<Self>,
    };
}

impl<T: Task> HasVTable for T {}

unsafe fn execute_thunk<T: Task>(task: *mut RawTask, core_id: u16, channel_id: u16) -> TaskResult {
    unsafe { (*payload_ptr::<T>(task)).execute(core_id, channel_id) }
}

unsafe fn drop_thunk<T: Task>(task: *mut RawTask) {
    unsafe { core::ptr::drop_in_place(payload_ptr::<T>(task)) }
}

#[inline]
fn payload_ptr<T>(task: *mut RawTask) -> *mut T {
    unsafe { task.cast::<u8>().add(TASK_HEADER_SIZE).cast::<T>() }
}

/// One task cell. Fixed size, cache-line aligned; the payload follows the
/// 32-byte header.
#[repr(C, align(64))]
pub(crate) struct RawTask {
    link: Link,
    vtable: &'static TaskVTable,
    pub(crate) annotation: Annotation,
    payload: [MaybeUninit<u8>; TASK_PAYLOAD_SIZE],
}

unsafe impl Intrusive for RawTask {}

const _: () = assert!(size_of::<RawTask>() == TASK_SIZE);
const _: () = assert!(align_of::<RawTask>() == 64);

impl RawTask {
    /// Construct a task of type `T` in the uninitialized cell at `cell`.
    ///
    /// # Safety
    /// `cell` must point to at least `TASK_HEADER_SIZE + size_of::<T>()`
    /// writable bytes aligned to 64.
    pub(crate) unsafe fn init<T: Task>(cell: *mut RawTask, value: T) -> TaskRef {
        const {
            assert!(
                align_of::<T>() <= TASK_HEADER_SIZE,
                "task type over-aligned for its cell"
            );
        }
        unsafe {
            (&raw mut (*cell).link).write(Link::new());
            (&raw mut (*cell).vtable).write(&T::VTABLE);
            (&raw mut (*cell).annotation).write(Annotation::default());
            payload_ptr::<T>(cell).write(value);
            TaskRef::from_raw(cell)
        }
    }

    /// Construct a cell-sized task, checking the payload bound at compile
    /// time.
    ///
    /// # Safety
    /// `cell` must point to `TASK_SIZE` writable bytes aligned to 64.
    pub(crate) unsafe fn init_in_cell<T: Task>(cell: *mut RawTask, value: T) -> TaskRef {
        const {
            assert!(
                size_of::<T>() <= TASK_PAYLOAD_SIZE,
                "task exceeds the task cell payload"
            );
        }
        unsafe { Self::init(cell, value) }
    }

    #[inline]
    pub(crate) unsafe fn execute(task: *mut RawTask, core_id: u16, channel_id: u16) -> TaskResult {
        unsafe { ((*task).vtable.execute)(task, core_id, channel_id) }
    }

    /// Drop the payload in place. The cell memory stays allocated.
    #[inline]
    pub(crate) unsafe fn drop_payload(task: *mut RawTask) {
        unsafe { ((*task).vtable.drop_payload)(task) }
    }

    /// Mark the cell as living outside the task allocator.
    pub(crate) unsafe fn mark_heap_backed(task: *mut RawTask) {
        unsafe { (*task).annotation.heap_backed = true };
    }
}

/// Owning handle to a spawnable task.
///
/// Behaves like a box into the task allocator: annotate the task through it,
/// then hand it to `spawn`, which consumes the handle.
pub struct TaskRef {
    raw: NonNull<RawTask>,
    _marker: PhantomData<*mut ()>,
}

// The handle moves between threads with its task; the task value itself is
// required to be Send by the `Task` bound.
unsafe impl Send for TaskRef {}

impl TaskRef {
    pub(crate) fn from_raw(raw: *mut RawTask) -> Self {
        Self {
            raw: NonNull::new(raw).expect("task cell must not be null"),
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_raw(self) -> *mut RawTask {
        self.raw.as_ptr()
    }

    #[inline]
    fn annotation_mut(&mut self) -> &mut Annotation {
        unsafe { &mut (*self.raw.as_ptr()).annotation }
    }

    #[inline]
    fn annotation(&self) -> &Annotation {
        unsafe { &(*self.raw.as_ptr()).annotation }
    }

    /// Annotate the resource this task reads or writes. `prefetch_size` is
    /// the number of bytes worth prefetching before execution.
    pub fn annotate_resource(&mut self, resource: ResourcePtr, prefetch_size: u16) {
        let annotation = self.annotation_mut();
        annotation.resource = resource;
        annotation.resource_size = prefetch_size;
        annotation.kind = TargetKind::Resource;
    }

    /// Annotate the exact channel the task should run on.
    pub fn annotate_channel(&mut self, channel_id: u16) {
        let annotation = self.annotation_mut();
        annotation.channel_or_node = channel_id;
        annotation.kind = TargetKind::Channel;
    }

    /// Annotate a NUMA node. The scheduler currently rejects node-only
    /// annotations at spawn time.
    pub fn annotate_node(&mut self, node_id: u8) {
        let annotation = self.annotation_mut();
        annotation.channel_or_node = u16::from(node_id);
        annotation.kind = TargetKind::Node;
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.annotation_mut().priority = priority;
    }

    /// Mark the task as only reading its annotated resource.
    pub fn set_readonly(&mut self, readonly: bool) {
        self.annotation_mut().readonly = readonly;
    }

    pub fn priority(&self) -> Priority {
        self.annotation().priority()
    }

    pub fn is_readonly(&self) -> bool {
        self.annotation().is_readonly()
    }

    pub fn annotated_resource(&self) -> Option<(ResourcePtr, u16)> {
        self.annotation().resource()
    }

    pub fn annotated_channel(&self) -> Option<u16> {
        self.annotation().channel()
    }

    pub fn annotated_node(&self) -> Option<u8> {
        self.annotation().node()
    }

    /// Raw pointer to the task value inside the cell.
    ///
    /// The pointer stays valid until the cell is returned to the allocator
    /// (removal or `delete_task`), which makes it usable for inspecting a
    /// task's state after the runtime stopped.
    ///
    /// # Safety
    /// `T` must be the type the task was created with.
    pub unsafe fn payload_ptr<T: Task>(&self) -> *mut T {
        payload_ptr::<T>(self.raw.as_ptr())
    }
}

impl core::fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskRef")
            .field("cell", &self.raw.as_ptr())
            .field("priority", &self.priority())
            .field("readonly", &self.is_readonly())
            .finish()
    }
}
