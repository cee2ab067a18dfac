//! Scheduling and execution counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and
//! never used for synchronization; the queues and latches provide the
//! ordering guarantees for correctness. Each channel gets its own padded
//! counter line so workers never share one.
//!
//! With the `statistics` feature disabled every call compiles to nothing
//! and reads return zero.

#[cfg(feature = "statistics")]
use core::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "statistics")]
use crossbeam_utils::CachePadded;

/// The counters kept per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Counter {
    /// Tasks handed to the scheduler.
    Scheduled = 0,
    /// Spawns that stayed on the spawning channel.
    ScheduledOnChannel = 1,
    /// Spawns routed to another channel.
    ScheduledOffChannel = 2,
    /// Tasks executed.
    Executed = 3,
    /// Executed tasks that were readers of their resource.
    ExecutedReader = 4,
    /// Executed tasks that were writers of their resource.
    ExecutedWriter = 5,
    /// Ready-buffer refills.
    Fill = 6,
}

const COUNTERS: usize = 7;

#[cfg(feature = "statistics")]
type CounterLine = CachePadded<[AtomicU64; COUNTERS]>;

/// Per-channel counter storage.
pub(crate) struct Statistics {
    #[cfg(feature = "statistics")]
    lines: Box<[CounterLine]>,
}

impl Statistics {
    pub(crate) fn new(count_channels: u16) -> Self {
        #[cfg(feature = "statistics")]
        {
            Self {
                lines: (0..count_channels)
                    .map(|_| CachePadded::new([const { AtomicU64::new(0) }; COUNTERS]))
                    .collect(),
            }
        }
        #[cfg(not(feature = "statistics"))]
        {
            let _ = count_channels;
            Self {}
        }
    }

    #[inline]
    pub(crate) fn increment(&self, counter: Counter, channel_id: u16) {
        #[cfg(feature = "statistics")]
        self.lines[channel_id as usize][counter as usize].fetch_add(1, Ordering::Relaxed);
        #[cfg(not(feature = "statistics"))]
        let _ = (counter, channel_id);
    }

    /// Counter value of one channel.
    pub(crate) fn get(&self, counter: Counter, channel_id: u16) -> u64 {
        #[cfg(feature = "statistics")]
        {
            self.lines[channel_id as usize][counter as usize].load(Ordering::Relaxed)
        }
        #[cfg(not(feature = "statistics"))]
        {
            let _ = (counter, channel_id);
            0
        }
    }

    /// Counter value aggregated over all channels.
    pub(crate) fn total(&self, counter: Counter) -> u64 {
        #[cfg(feature = "statistics")]
        {
            (0..self.lines.len() as u16)
                .map(|channel_id| self.get(counter, channel_id))
                .sum()
        }
        #[cfg(not(feature = "statistics"))]
        {
            let _ = counter;
            0
        }
    }

    /// Zero every counter.
    pub(crate) fn clear(&self) {
        #[cfg(feature = "statistics")]
        for line in self.lines.iter() {
            for counter in line.iter() {
                counter.store(0, Ordering::Relaxed);
            }
        }
    }
}
