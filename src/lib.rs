//! taskline: a task-based execution runtime for multi-core, NUMA-aware
//! machines.
//!
//! Computations are expressed as small fixed-size [`Task`]s annotated with
//! the [`Resource`] they read or write. The runtime pins one worker per
//! core, places every resource on a home channel, and picks the
//! synchronization discipline for each resource from its declared isolation
//! requirements — serial scheduling on the home channel, latches, or
//! optimistic versioning with epoch-based reclamation. Application code
//! never takes a latch itself.
//!
//! # Example
//!
//! ```no_run
//! use taskline::{CoreSet, Order, Runtime, Task, TaskResult};
//!
//! struct Hello;
//!
//! impl Task for Hello {
//!     fn execute(&mut self, _core_id: u16, _channel_id: u16) -> TaskResult {
//!         println!("hello from the runtime");
//!         TaskResult::stop()
//!     }
//! }
//!
//! let runtime = Runtime::init(CoreSet::build(2, Order::Ascending), 0, false).unwrap();
//! let mut task = unsafe { runtime.new_task(0, Hello) };
//! task.annotate_channel(0);
//! runtime.spawn(task);
//! runtime.start_and_wait();
//! ```

pub mod config;
pub mod platform;
pub mod queue;
pub mod sync;
pub mod topology;

mod builder;
mod channel;
mod epoch;
mod primitive;
mod profile;
mod resource;
mod resource_alloc;
mod runtime;
mod scheduler;
mod stats;
mod task;
mod task_alloc;
mod task_buffer;
mod worker;

pub use epoch::MemoryReclamation;
pub use primitive::{IsolationLevel, Primitive, Protocol, select_primitive};
pub use resource::{AccessFrequency, Hint, ReadWriteRatio, Resource, ResourceHeader, ResourcePtr};
pub use runtime::{Runtime, RuntimeError, RuntimeOptions};
pub use stats::Counter;
pub use task::{Priority, TASK_PAYLOAD_SIZE, Task, TaskRef, TaskResult};
pub use topology::{CoreSet, Order};
