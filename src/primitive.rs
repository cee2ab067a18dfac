//! Synchronization requirements and the concrete primitives chosen from
//! them.
//!
//! A resource declares *what* isolation it needs ([`IsolationLevel`]) and
//! optionally *how* it prefers to get it ([`Protocol`]); the runtime maps
//! that, together with the access-pattern hints, to one concrete
//! [`Primitive`] that stays fixed for the resource's lifetime.

use crate::resource::{AccessFrequency, ReadWriteRatio};

/// Desired isolation of accesses to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Reads may run in parallel, writes are synchronized.
    ExclusiveWriter,
    /// Every access is synchronized.
    Exclusive,
    /// Nothing is synchronized.
    #[default]
    None,
}

/// Preferred synchronization protocol, fixed by the developer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// The runtime is free to choose.
    #[default]
    None,
    /// Serialize through the home channel's queue.
    Queue,
    /// Use a latch.
    Latch,
    /// Use optimistic latch-free validation.
    Olfit,
    /// Reserved; treated like `None`.
    TransactionalMemory,
}

/// Concrete synchronization discipline of a resource.
///
/// Stored in the high bits of a tagged resource pointer using 4 bits; the
/// discriminants must stay below 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Primitive {
    /// No synchronization at all.
    #[default]
    None = 0,
    /// A spinlock around every access.
    ExclusiveLatch = 1,
    /// All accesses are routed to the home channel and run serially there.
    ScheduleAll = 2,
    /// Reader/writer latch; readers share.
    ReaderWriterLatch = 3,
    /// Writers are routed to the home channel, readers validate optimistically.
    ScheduleWriter = 4,
    /// Optimistic with CAS-acquired writes from any channel.
    Olfit = 5,
}

impl Primitive {
    pub(crate) fn from_tag(tag: u8) -> Self {
        match tag {
            1 => Self::ExclusiveLatch,
            2 => Self::ScheduleAll,
            3 => Self::ReaderWriterLatch,
            4 => Self::ScheduleWriter,
            5 => Self::Olfit,
            _ => Self::None,
        }
    }

    /// True for the primitives whose readers run without latches and whose
    /// memory therefore needs epoch-based reclamation.
    pub fn is_optimistic(self) -> bool {
        matches!(self, Self::ScheduleWriter | Self::Olfit)
    }
}

/// Select a primitive for a resource without a fixed protocol preference.
///
/// Concentrated hot writers are cheapest to serialize on one channel;
/// balanced or mostly-read cold resources get optimistic validation because
/// conflicting writers are rare; write-heavy cold resources take the
/// reader/writer latch instead of paying optimistic retry storms.
pub fn select_primitive(
    isolation: IsolationLevel,
    frequency: AccessFrequency,
    ratio: ReadWriteRatio,
) -> Primitive {
    use AccessFrequency::{Excessive, High};
    use Primitive::*;
    use ReadWriteRatio::*;

    let hot = matches!(frequency, Excessive | High);

    match isolation {
        IsolationLevel::None => None,
        IsolationLevel::Exclusive => {
            if hot {
                ScheduleAll
            } else {
                ExclusiveLatch
            }
        }
        IsolationLevel::ExclusiveWriter => match ratio {
            HeavyRead => ScheduleWriter,
            MostlyRead => {
                if hot {
                    ScheduleWriter
                } else {
                    Olfit
                }
            }
            Balanced => Olfit,
            MostlyWritten => {
                if hot {
                    Olfit
                } else {
                    ReaderWriterLatch
                }
            }
            HeavyWritten => {
                if hot {
                    ScheduleAll
                } else {
                    ReaderWriterLatch
                }
            }
        },
    }
}

/// Resolve the primitive for a hint, honoring a fixed protocol preference
/// before consulting the matrix.
pub fn resolve(
    isolation: IsolationLevel,
    protocol: Protocol,
    frequency: AccessFrequency,
    ratio: ReadWriteRatio,
) -> Primitive {
    if protocol == Protocol::None || protocol == Protocol::TransactionalMemory {
        return select_primitive(isolation, frequency, ratio);
    }

    match isolation {
        IsolationLevel::ExclusiveWriter => match protocol {
            Protocol::Latch => Primitive::ReaderWriterLatch,
            Protocol::Olfit => Primitive::Olfit,
            _ => Primitive::ScheduleWriter,
        },
        IsolationLevel::Exclusive => {
            if protocol == Protocol::Latch {
                Primitive::ExclusiveLatch
            } else {
                Primitive::ScheduleAll
            }
        }
        IsolationLevel::None => Primitive::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AccessFrequency::*;
    use ReadWriteRatio::*;

    #[test]
    fn test_no_isolation_never_synchronizes() {
        for frequency in [Excessive, High, Normal, Unused] {
            for ratio in [HeavyRead, MostlyRead, Balanced, MostlyWritten, HeavyWritten] {
                assert_eq!(
                    select_primitive(IsolationLevel::None, frequency, ratio),
                    Primitive::None
                );
            }
        }
    }

    #[test]
    fn test_exclusive_writer_matrix() {
        let select = |frequency, ratio| {
            select_primitive(IsolationLevel::ExclusiveWriter, frequency, ratio)
        };

        for frequency in [Excessive, High, Normal, Unused] {
            assert_eq!(select(frequency, HeavyRead), Primitive::ScheduleWriter);
            assert_eq!(select(frequency, Balanced), Primitive::Olfit);
        }

        assert_eq!(select(Excessive, MostlyRead), Primitive::ScheduleWriter);
        assert_eq!(select(High, MostlyRead), Primitive::ScheduleWriter);
        assert_eq!(select(Normal, MostlyRead), Primitive::Olfit);
        assert_eq!(select(Unused, MostlyRead), Primitive::Olfit);

        assert_eq!(select(Excessive, MostlyWritten), Primitive::Olfit);
        assert_eq!(select(Normal, MostlyWritten), Primitive::ReaderWriterLatch);

        assert_eq!(select(Excessive, HeavyWritten), Primitive::ScheduleAll);
        assert_eq!(select(High, HeavyWritten), Primitive::ScheduleAll);
        assert_eq!(select(Normal, HeavyWritten), Primitive::ReaderWriterLatch);
        assert_eq!(select(Unused, HeavyWritten), Primitive::ReaderWriterLatch);
    }

    #[test]
    fn test_exclusive_serializes_hot_latches_cold() {
        for ratio in [HeavyRead, Balanced, HeavyWritten] {
            assert_eq!(
                select_primitive(IsolationLevel::Exclusive, Excessive, ratio),
                Primitive::ScheduleAll
            );
            assert_eq!(
                select_primitive(IsolationLevel::Exclusive, Normal, ratio),
                Primitive::ExclusiveLatch
            );
        }
    }

    #[test]
    fn test_protocol_overrides() {
        let resolve_with = |isolation, protocol| resolve(isolation, protocol, Normal, Balanced);

        assert_eq!(
            resolve_with(IsolationLevel::Exclusive, Protocol::Queue),
            Primitive::ScheduleAll
        );
        assert_eq!(
            resolve_with(IsolationLevel::ExclusiveWriter, Protocol::Queue),
            Primitive::ScheduleWriter
        );
        assert_eq!(
            resolve_with(IsolationLevel::Exclusive, Protocol::Latch),
            Primitive::ExclusiveLatch
        );
        assert_eq!(
            resolve_with(IsolationLevel::ExclusiveWriter, Protocol::Latch),
            Primitive::ReaderWriterLatch
        );
        assert_eq!(
            resolve_with(IsolationLevel::ExclusiveWriter, Protocol::Olfit),
            Primitive::Olfit
        );
        assert_eq!(
            resolve_with(IsolationLevel::None, Protocol::Latch),
            Primitive::None
        );
    }

    #[test]
    fn test_tag_roundtrip() {
        for primitive in [
            Primitive::None,
            Primitive::ExclusiveLatch,
            Primitive::ScheduleAll,
            Primitive::ReaderWriterLatch,
            Primitive::ScheduleWriter,
            Primitive::Olfit,
        ] {
            assert_eq!(Primitive::from_tag(primitive as u8), primitive);
        }
    }
}
