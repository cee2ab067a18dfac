//! Idle-time profiling.
//!
//! When enabled, a low-priority task is planted on every channel. It only
//! gets CPU time when nothing else is ready, and then measures how long the
//! channel stays empty; each span above the noise floor becomes one idle
//! range. After the runtime stopped, the ranges are written as JSON:
//! an array of `{"channel": n, "ranges": [{"s": ns, "e": ns}, ...]}`
//! entries followed by a final `{"end": ns}` object, all times relative to
//! the profiling start.

use core::sync::atomic::{AtomicBool, Ordering};
use std::path::PathBuf;
use std::time::Instant;

use serde::Serialize;

use crate::channel::Channel;
use crate::config::TASK_HEADER_SIZE;
use crate::scheduler::Scheduler;
use crate::sync::SpinMutex;
use crate::task::{Priority, RawTask, Task, TaskRef, TaskResult};

/// Idle spans shorter than this are measurement noise and dropped.
const MIN_IDLE_NANOSECONDS: u128 = 10;

/// One idle span of a single channel.
struct IdleRange {
    start: Instant,
    end: Instant,
}

/// The per-channel idle probe. Runs at low priority and spins the channel's
/// refill until work shows up.
struct IdleProbeTask {
    is_running: *const AtomicBool,
    channel: *const Channel,
    idle_ranges: Vec<IdleRange>,
}

// Points into scheduler-owned state that outlives all workers.
unsafe impl Send for IdleProbeTask {}

impl Task for IdleProbeTask {
    fn execute(&mut self, _core_id: u16, _channel_id: u16) -> TaskResult {
        let start = Instant::now();

        // Executing on the owning worker, so driving the channel is sound.
        unsafe {
            while (*self.is_running).load(Ordering::Acquire) && (*self.channel).buffer_is_empty() {
                (*self.channel).fill();
            }
        }

        let end = Instant::now();
        if (end - start).as_nanos() > MIN_IDLE_NANOSECONDS {
            self.idle_ranges.push(IdleRange { start, end });
        }

        if unsafe { (*self.is_running).load(Ordering::Acquire) } {
            TaskResult::repeat()
        } else {
            TaskResult::null()
        }
    }
}

#[derive(Serialize)]
struct RangeOutput {
    s: u64,
    e: u64,
}

#[derive(Serialize)]
struct ChannelOutput {
    channel: u16,
    ranges: Vec<RangeOutput>,
}

struct ProbeCell(*mut RawTask);
unsafe impl Send for ProbeCell {}

/// Plants the idle probes and renders their measurements.
pub(crate) struct Profiler {
    output_file: SpinMutex<Option<PathBuf>>,
    start: SpinMutex<Option<Instant>>,
    /// Heap-backed probe cells; the probes outlive the run and are read
    /// back after the workers joined.
    probes: SpinMutex<Vec<ProbeCell>>,
}

impl Profiler {
    pub(crate) fn new() -> Self {
        Self {
            output_file: SpinMutex::new(None),
            start: SpinMutex::new(None),
            probes: SpinMutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.output_file.lock().is_some()
    }

    /// Enable profiling; results go to `path` when the runtime stops.
    pub(crate) fn enable(&self, path: PathBuf) {
        *self.output_file.lock() = Some(path);
        *self.start.lock() = Some(Instant::now());
        self.free_probes();
    }

    /// Plant one probe per channel. Called before the workers start.
    pub(crate) fn attach(&self, scheduler: &Scheduler) {
        let mut probes = self.probes.lock();
        for worker in scheduler.workers() {
            let channel = worker.channel();
            let cell = alloc_probe_cell();
            let mut task = unsafe {
                RawTask::init(
                    cell,
                    IdleProbeTask {
                        is_running: scheduler.running_flag() as *const AtomicBool,
                        channel: channel as *const Channel,
                        idle_ranges: Vec::with_capacity(1 << 16),
                    },
                )
            };
            task.annotate_channel(channel.id());
            task.set_priority(Priority::Low);
            unsafe { RawTask::mark_heap_backed(TaskRef::into_raw(task)) };
            probes.push(ProbeCell(cell));
            scheduler.schedule_remote(TaskRef::from_raw(cell));
        }
    }

    /// Render and write the collected ranges. Called after the workers
    /// joined; disables profiling again.
    pub(crate) fn write_output(&self) {
        let Some(path) = self.output_file.lock().take() else {
            return;
        };
        let Some(start) = self.start.lock().take() else {
            return;
        };
        let end_nanoseconds = (Instant::now() - start).as_nanos() as u64;

        let mut output: Vec<serde_json::Value> = Vec::new();
        for probe in self.probes.lock().iter() {
            let task = unsafe { &*payload_of(probe.0) };
            if task.idle_ranges.is_empty() {
                continue;
            }

            let ranges = task
                .idle_ranges
                .iter()
                .map(|range| RangeOutput {
                    s: (range.start - start).as_nanos() as u64,
                    e: (range.end - start).as_nanos() as u64,
                })
                .collect();
            let channel = unsafe { (*task.channel).id() };
            output.push(
                serde_json::to_value(ChannelOutput { channel, ranges })
                    .expect("idle ranges serialize"),
            );
        }
        output.push(serde_json::json!({ "end": end_nanoseconds }));

        match serde_json::to_string(&output) {
            Ok(rendered) => {
                if let Err(error) = std::fs::write(&path, rendered) {
                    tracing::warn!(?path, %error, "could not write idle profile");
                }
            }
            Err(error) => tracing::warn!(%error, "could not render idle profile"),
        }
    }

    fn free_probes(&self) {
        for probe in self.probes.lock().drain(..) {
            unsafe {
                RawTask::drop_payload(probe.0);
                free_probe_cell(probe.0);
            }
        }
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        self.free_probes();
    }
}

// The probe task carries a Vec and does not fit a task cell; its cells live
// on the process heap instead of the task allocator.
fn probe_layout() -> std::alloc::Layout {
    std::alloc::Layout::from_size_align(TASK_HEADER_SIZE + size_of::<IdleProbeTask>(), 64).unwrap()
}

fn alloc_probe_cell() -> *mut RawTask {
    let cell = unsafe { std::alloc::alloc(probe_layout()) };
    assert!(!cell.is_null(), "probe allocation failed");
    cell.cast()
}

unsafe fn free_probe_cell(cell: *mut RawTask) {
    unsafe { std::alloc::dealloc(cell.cast(), probe_layout()) };
}

fn payload_of(cell: *mut RawTask) -> *mut IdleProbeTask {
    unsafe { cell.cast::<u8>().add(TASK_HEADER_SIZE).cast() }
}
