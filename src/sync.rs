//! Synchronization primitives wrapped around task execution.
//!
//! These are the building blocks the worker's dispatch selects from: a
//! test-and-set spinlock, a reader/writer spinlock and an optimistic version
//! lock. They are embedded in every synchronized resource header, so they
//! must be small and const-constructible; `std::sync::Mutex` is neither.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::platform;

/// A simple test-and-set spinlock.
pub struct SpinLock {
    locked: AtomicBool,
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            // Spin on a plain load so the line is not bounced while held.
            while self.locked.load(Ordering::Relaxed) {
                platform::pause();
            }
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// A mutex using a spinlock for synchronization. Does not allocate and can
/// be used in a `static`.
pub struct SpinMutex<T> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: SpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        self.lock.lock();
        SpinMutexGuard { mutex: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self.lock.try_lock() {
            Some(SpinMutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Exclusive access without locking.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

/// RAII guard for `SpinMutex`. Unlocks on drop.
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

/// Reader/writer spinlock: readers share, one writer excludes.
///
/// State word: bit 31 is the writer flag, the low bits count readers. A
/// writer waits for the count to drain; readers wait while the writer bit is
/// set.
pub struct RwSpinLock {
    state: AtomicU32,
}

const WRITER: u32 = 1 << 31;

impl Default for RwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwSpinLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn lock(&self) {
        loop {
            while self.state.load(Ordering::Relaxed) != 0 {
                platform::pause();
            }
            if self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        // The writer waited for all readers to drain, so the state is
        // exactly WRITER here.
        self.state.store(0, Ordering::Release);
    }

    #[inline]
    pub fn lock_shared(&self) {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            platform::pause();
        }
    }

    #[inline]
    pub fn unlock_shared(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }
}

/// Optimistic version lock.
///
/// The version is even while unlocked and odd in bit 1 while a writer holds
/// it. Readers snapshot a valid (unlocked) version, run, and re-check it;
/// any write in between changes the version and invalidates the read.
///
/// Writers come in two flavours matching the two optimistic primitives: a
/// single serialized writer bumps the version with a plain `fetch_add`
/// (`lock_single_writer`), concurrent writers must win a compare-exchange
/// (`lock`).
pub struct OptimisticLock {
    version: AtomicU32,
}

const VERSION_LOCKED: u32 = 0b10;

impl Default for OptimisticLock {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimisticLock {
    pub const fn new() -> Self {
        Self {
            version: AtomicU32::new(0b100),
        }
    }

    #[inline]
    fn is_locked(version: u32) -> bool {
        version & VERSION_LOCKED == VERSION_LOCKED
    }

    /// Blocks until the version is not locked, then returns it.
    #[inline]
    pub fn read_valid(&self) -> u32 {
        let mut version = self.version.load(Ordering::SeqCst);
        while Self::is_locked(version) {
            platform::pause();
            version = self.version.load(Ordering::SeqCst);
        }
        version
    }

    /// True when the given snapshot is still the current version.
    #[inline]
    pub fn is_valid(&self, version: u32) -> bool {
        version == self.version.load(Ordering::SeqCst)
    }

    /// Try to move the version from valid to locked.
    #[inline]
    pub fn try_lock(&self) -> bool {
        let version = self.read_valid();
        self.version
            .compare_exchange(
                version,
                version + VERSION_LOCKED,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Acquire as the only writer. Sound only while all writers are
    /// serialized on the resource's home channel.
    #[inline]
    pub fn lock_single_writer(&self) {
        self.version.fetch_add(VERSION_LOCKED, Ordering::SeqCst);
    }

    /// Acquire against concurrent writers, with exponential backoff.
    pub fn lock(&self) {
        let mut tries: u64 = 1;
        while !self.try_lock() {
            let wait = tries * 32;
            tries += 1;
            for _ in 0..wait {
                platform::pause();
            }
        }
    }

    /// Release, making the version valid (and different) again.
    #[inline]
    pub fn unlock(&self) {
        self.version.fetch_add(VERSION_LOCKED, Ordering::SeqCst);
    }
}
