//! Lifecycle and scheduling behavior of the full runtime.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use taskline::{
    CoreSet, Counter, Hint, IsolationLevel, Order, Primitive, Protocol, Resource, ResourceHeader,
    ResourcePtr, Runtime, Task, TaskRef, TaskResult,
};

// One live runtime per process; the tests take turns.
static RUNTIME_GATE: Mutex<()> = Mutex::new(());

fn gate() -> std::sync::MutexGuard<'static, ()> {
    RUNTIME_GATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn cores_available(wanted: u16) -> bool {
    std::thread::available_parallelism().map_or(1, usize::from) >= wanted as usize
}

struct CountAndStop {
    hits: *const AtomicUsize,
}

unsafe impl Send for CountAndStop {}

impl Task for CountAndStop {
    fn execute(&mut self, _core_id: u16, _channel_id: u16) -> TaskResult {
        unsafe { (*self.hits).fetch_add(1, Ordering::SeqCst) };
        TaskResult::stop()
    }
}

#[test]
fn test_hello_execute() {
    let _guard = gate();
    let runtime = Runtime::init(CoreSet::build(1, Order::Ascending), 0, false).unwrap();
    let hits = AtomicUsize::new(0);

    let mut task = unsafe {
        runtime.new_task(
            0,
            CountAndStop {
                hits: &hits as *const AtomicUsize,
            },
        )
    };
    task.annotate_channel(0);
    runtime.spawn(task);

    runtime.start_and_wait();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    if cfg!(feature = "statistics") {
        // The user task plus the stop task it spawned.
        assert_eq!(runtime.statistic(Counter::Scheduled), 2);
        assert_eq!(runtime.statistic(Counter::Executed), 2);
        assert_eq!(
            runtime.statistic(Counter::Scheduled),
            runtime.statistic(Counter::Executed)
        );
    }
}

#[test]
fn test_init_guard_rejects_second_runtime() {
    let _guard = gate();
    let runtime = Runtime::init(CoreSet::build(1, Order::Ascending), 0, false).unwrap();
    assert!(matches!(
        Runtime::init(CoreSet::build(1, Order::Ascending), 0, false),
        Err(taskline::RuntimeError::AlreadyLive)
    ));
    drop(runtime);

    // The guard clears on drop.
    let runtime = Runtime::init(CoreSet::build(1, Order::Ascending), 0, false).unwrap();
    drop(runtime);
}

#[test]
fn test_init_rejects_empty_core_set() {
    let _guard = gate();
    assert!(matches!(
        Runtime::init(CoreSet::new(Vec::new()), 0, false),
        Err(taskline::RuntimeError::EmptyCoreSet)
    ));
}

/// A synchronized cell recording which channel wrote it.
#[repr(C)]
struct ChannelRecorder {
    header: ResourceHeader,
    executed_on: u16,
    writes: u64,
}

unsafe impl Resource for ChannelRecorder {}

impl ChannelRecorder {
    fn new() -> Self {
        Self {
            header: ResourceHeader::new(),
            executed_on: u16::MAX,
            writes: 0,
        }
    }
}

/// Writes its executing channel into the annotated recorder, then stops.
struct RecordChannel {
    resource: ResourcePtr,
}

impl Task for RecordChannel {
    fn execute(&mut self, _core_id: u16, channel_id: u16) -> TaskResult {
        // Serialized on the home channel by ScheduleAll.
        let recorder = self.resource.as_ptr::<ChannelRecorder>();
        unsafe {
            (*recorder).executed_on = channel_id;
            (*recorder).writes += 1;
        }
        TaskResult::stop()
    }
}

/// Hands its inner task to the scheduler from the channel it runs on.
struct Bootstrap {
    inner: Option<TaskRef>,
}

impl Task for Bootstrap {
    fn execute(&mut self, _core_id: u16, _channel_id: u16) -> TaskResult {
        match self.inner.take() {
            Some(inner) => TaskResult::succeed_and_remove(inner),
            None => TaskResult::remove(),
        }
    }
}

#[test]
fn test_schedule_all_routes_writer_to_home_channel() {
    if !cores_available(2) {
        return;
    }
    let _guard = gate();
    let runtime = Runtime::init(CoreSet::build(2, Order::Ascending), 0, false).unwrap();

    // The recorder lives on channel 1 and serializes everything there.
    let resource = runtime.new_resource(
        size_of::<ChannelRecorder>(),
        Hint::new()
            .channel(1)
            .isolation(IsolationLevel::Exclusive)
            .protocol(Protocol::Queue),
        ChannelRecorder::new(),
    );
    assert_eq!(resource.primitive(), Primitive::ScheduleAll);
    assert_eq!(resource.channel_id(), 1);

    // The writer starts out on channel 0 and must travel.
    let mut writer = unsafe { runtime.new_task(0, RecordChannel { resource }) };
    writer.annotate_resource(resource, 64);

    let mut bootstrap = unsafe {
        runtime.new_task(
            0,
            Bootstrap {
                inner: Some(writer),
            },
        )
    };
    bootstrap.annotate_channel(0);
    runtime.spawn(bootstrap);

    runtime.start_and_wait();

    let recorder = resource.as_ptr::<ChannelRecorder>();
    unsafe {
        assert_eq!((*recorder).executed_on, 1);
        assert_eq!((*recorder).writes, 1);
    }
    if cfg!(feature = "statistics") {
        assert_eq!(runtime.statistic_for(Counter::ScheduledOffChannel, 0), 2);
        assert!(runtime.statistic_for(Counter::Executed, 1) >= 1);
    }

    unsafe { runtime.delete_resource(resource) };
}

struct RepeatChain {
    hits: *const AtomicUsize,
    remaining: u32,
}

unsafe impl Send for RepeatChain {}

impl Task for RepeatChain {
    fn execute(&mut self, _core_id: u16, _channel_id: u16) -> TaskResult {
        unsafe { (*self.hits).fetch_add(1, Ordering::SeqCst) };
        self.remaining -= 1;
        if self.remaining == 0 {
            TaskResult::stop()
        } else {
            TaskResult::repeat()
        }
    }
}

#[test]
fn test_no_lost_tasks_in_repeat_chain() {
    let _guard = gate();
    let runtime = Runtime::init(CoreSet::build(1, Order::Ascending), 0, false).unwrap();
    let hits = AtomicUsize::new(0);
    let rounds = 10_000u32;

    let mut task = unsafe {
        runtime.new_task(
            0,
            RepeatChain {
                hits: &hits as *const AtomicUsize,
                remaining: rounds,
            },
        )
    };
    task.annotate_channel(0);
    runtime.spawn(task);

    runtime.start_and_wait();

    assert_eq!(hits.load(Ordering::SeqCst), rounds as usize);
    if cfg!(feature = "statistics") {
        // Every execution was scheduled exactly once and nothing remained
        // queued.
        assert_eq!(
            runtime.statistic(Counter::Scheduled),
            runtime.statistic(Counter::Executed)
        );
        assert_eq!(runtime.statistic(Counter::Executed), rounds as u64 + 1);
    }
}

struct LinkedStep {
    hits: *const AtomicUsize,
    next: Option<TaskRef>,
}

unsafe impl Send for LinkedStep {}

impl Task for LinkedStep {
    fn execute(&mut self, _core_id: u16, _channel_id: u16) -> TaskResult {
        unsafe { (*self.hits).fetch_add(1, Ordering::SeqCst) };
        match self.next.take() {
            Some(next) => TaskResult::succeed_and_remove(next),
            None => TaskResult::stop(),
        }
    }
}

#[test]
fn test_successor_chain_executes_every_task_once() {
    let _guard = gate();
    let runtime = Runtime::init(CoreSet::build(1, Order::Ascending), 0, false).unwrap();
    let hits = AtomicUsize::new(0);
    let length = 512usize;

    // Build back to front so every task knows its successor.
    let mut next: Option<TaskRef> = None;
    for _ in 0..length {
        let task = unsafe {
            runtime.new_task(
                0,
                LinkedStep {
                    hits: &hits as *const AtomicUsize,
                    next: next.take(),
                },
            )
        };
        next = Some(task);
    }
    let mut head = next.unwrap();
    head.annotate_channel(0);
    runtime.spawn(head);

    runtime.start_and_wait();

    assert_eq!(hits.load(Ordering::SeqCst), length);
    if cfg!(feature = "statistics") {
        assert_eq!(
            runtime.statistic(Counter::Scheduled),
            runtime.statistic(Counter::Executed)
        );
    }
}

/// Appends its tag to the recorder under home-channel serialization.
struct AppendTag {
    resource: ResourcePtr,
    tag: u64,
    stop_after: bool,
}

impl Task for AppendTag {
    fn execute(&mut self, _core_id: u16, _channel_id: u16) -> TaskResult {
        let recorder = self.resource.as_ptr::<ChannelRecorder>();
        unsafe {
            (*recorder).writes = (*recorder).writes * 10 + self.tag;
        }
        if self.stop_after {
            TaskResult::stop()
        } else {
            TaskResult::remove()
        }
    }
}

#[test]
fn test_fifo_per_channel_and_source() {
    if !cores_available(2) {
        return;
    }
    let _guard = gate();
    let runtime = Runtime::init(CoreSet::build(2, Order::Ascending), 0, false).unwrap();

    let resource = runtime.new_resource(
        size_of::<ChannelRecorder>(),
        Hint::new()
            .channel(1)
            .isolation(IsolationLevel::Exclusive)
            .protocol(Protocol::Queue),
        ChannelRecorder::new(),
    );

    // Same producer, same target queue: arrival order is execution order.
    for (tag, stop_after) in [(1u64, false), (2, false), (3, true)] {
        let mut task = unsafe {
            runtime.new_task(
                0,
                AppendTag {
                    resource,
                    tag,
                    stop_after,
                },
            )
        };
        task.annotate_resource(resource, 64);
        runtime.spawn(task);
    }

    runtime.start_and_wait();

    let recorder = resource.as_ptr::<ChannelRecorder>();
    assert_eq!(unsafe { (*recorder).writes }, 123);

    unsafe { runtime.delete_resource(resource) };
}

#[test]
fn test_to_resource_wraps_external_object() {
    let _guard = gate();
    let runtime = Runtime::init(CoreSet::build(1, Order::Ascending), 0, false).unwrap();

    // The object stays owned by the test; the runtime only tags it.
    let mut recorder = ChannelRecorder::new();
    let recorder_ptr = &mut recorder as *mut ChannelRecorder;
    let resource = runtime.to_resource(
        recorder_ptr,
        Hint::new()
            .channel(0)
            .isolation(IsolationLevel::Exclusive)
            .protocol(Protocol::Queue),
    );
    assert_eq!(resource.primitive(), Primitive::ScheduleAll);
    assert_eq!(resource.as_ptr::<ChannelRecorder>(), recorder_ptr);

    let mut writer = unsafe { runtime.new_task(0, RecordChannel { resource }) };
    writer.annotate_resource(resource, 64);
    runtime.spawn(writer);

    runtime.start_and_wait();

    assert_eq!(recorder.executed_on, 0);
    assert_eq!(recorder.writes, 1);
    assert!(runtime.resource_heap_is_free());
}

#[test]
fn test_delete_unspawned_task() {
    let _guard = gate();
    let runtime = Runtime::init(CoreSet::build(1, Order::Ascending), 0, false).unwrap();
    let hits = AtomicUsize::new(0);

    unsafe {
        let task = runtime.new_task(
            0,
            CountAndStop {
                hits: &hits as *const AtomicUsize,
            },
        );
        runtime.delete_task(0, task);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_profile_writes_idle_ranges() {
    let _guard = gate();
    let runtime = Runtime::init(CoreSet::build(1, Order::Ascending), 0, false).unwrap();
    let path = std::env::temp_dir().join(format!("taskline-idle-{}.json", std::process::id()));

    let hits = AtomicUsize::new(0);
    let mut task = unsafe {
        runtime.new_task(
            0,
            RepeatChain {
                hits: &hits as *const AtomicUsize,
                remaining: 100,
            },
        )
    };
    task.annotate_channel(0);
    runtime.spawn(task);

    runtime.profile(&path);
    runtime.start_and_wait();

    let rendered = std::fs::read_to_string(&path).unwrap();
    let parsed: Vec<serde_json::Value> = serde_json::from_str(&rendered).unwrap();
    let end = parsed.last().unwrap();
    assert!(end.get("end").is_some_and(|value| value.is_u64()));
    for entry in &parsed[..parsed.len() - 1] {
        assert!(entry.get("channel").is_some());
        assert!(entry.get("ranges").is_some_and(|ranges| ranges.is_array()));
    }

    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_stop_from_outside_discards_queued_tasks() {
    let _guard = gate();
    let runtime = Runtime::init(CoreSet::build(1, Order::Ascending), 0, false).unwrap();
    let hits = AtomicUsize::new(0);

    let mut task = unsafe {
        runtime.new_task(
            0,
            RepeatChain {
                hits: &hits as *const AtomicUsize,
                remaining: u32::MAX,
            },
        )
    };
    task.annotate_channel(0);
    runtime.spawn(task);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            while hits.load(Ordering::SeqCst) < 100 {
                std::hint::spin_loop();
            }
            runtime.stop();
        });
        runtime.start_and_wait();
    });

    assert!(hits.load(Ordering::SeqCst) >= 100);
    if cfg!(feature = "statistics") {
        // The repeat still queued at the stop was scheduled but never
        // executed.
        let scheduled = runtime.statistic(Counter::Scheduled);
        let executed = runtime.statistic(Counter::Executed);
        assert!(scheduled == executed || scheduled == executed + 1);
    }
}
