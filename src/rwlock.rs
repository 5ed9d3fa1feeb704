//! The module of reader-writer locks.
//!
//! [`SharedMutex`] is the raw lock; [`RwLock`] owns the data it protects.

use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering::*},
};

use crossbeam_utils::CachePadded;

use crate::{
    os::{Error, OsSemaphore, PlatformSemaphore},
    sema::Semaphore,
};

const READERS_SHIFT: u32 = 0;
const READERS_BITS: u32 = 22;
const WRITERS_SHIFT: u32 = READERS_SHIFT + READERS_BITS;
const WRITERS_BITS: u32 = 22;
const WAITING_SHIFT: u32 = WRITERS_SHIFT + WRITERS_BITS;
const WAITING_BITS: u32 = 20;

const _: () = assert!(READERS_BITS + WRITERS_BITS + WAITING_BITS <= u64::BITS);

/// The packed state word: `[readers:22][writers:22][waiting readers:20]`,
/// from the least significant bit.
#[derive(Clone, Copy, PartialEq, Eq)]
struct State(u64);

impl State {
    const MAX_READERS: u64 = (1 << READERS_BITS) - 1;
    const MAX_WRITERS: u64 = (1 << WRITERS_BITS) - 1;
    const MAX_WAITING: u64 = (1 << WAITING_BITS) - 1;

    const fn field(self, shift: u32, bits: u32) -> u64 {
        (self.0 >> shift) & ((1 << bits) - 1)
    }

    const fn with_field(self, shift: u32, bits: u32, value: u64) -> Self {
        let mask = ((1 << bits) - 1) << shift;
        State((self.0 & !mask) | ((value << shift) & mask))
    }

    const fn readers(self) -> u64 {
        self.field(READERS_SHIFT, READERS_BITS)
    }

    const fn writers(self) -> u64 {
        self.field(WRITERS_SHIFT, WRITERS_BITS)
    }

    const fn waiting(self) -> u64 {
        self.field(WAITING_SHIFT, WAITING_BITS)
    }

    const fn with_readers(self, readers: u64) -> Self {
        self.with_field(READERS_SHIFT, READERS_BITS, readers)
    }

    const fn with_writers(self, writers: u64) -> Self {
        self.with_field(WRITERS_SHIFT, WRITERS_BITS, writers)
    }

    const fn with_waiting(self, waiting: u64) -> Self {
        self.with_field(WAITING_SHIFT, WAITING_BITS, waiting)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("readers", &self.readers())
            .field("writers", &self.writers())
            .field("waiting", &self.waiting())
            .finish()
    }
}

/// A reader-writer lock built from one atomic word and two semaphores.
///
/// The state word counts active readers, writers (the active one plus the
/// queued ones) and readers waiting for the writers to finish. Every
/// transition is a single CAS over the whole word; threads that cannot
/// proceed park on the read or the write semaphore, and the thread leaving
/// the lock wakes exactly the threads it hands the lock to:
///
/// - the last reader out wakes one queued writer;
/// - a writer out promotes every waiting reader at once, or otherwise wakes
///   the next queued writer.
///
/// Readers arriving while a writer is active or queued wait, so writers are
/// not starved.
///
/// Overflowing any of the counters panics.
pub struct SharedMutex<S: PlatformSemaphore = OsSemaphore> {
    state: CachePadded<AtomicU64>,
    read_sema: Semaphore<S>,
    write_sema: Semaphore<S>,
}

impl SharedMutex {
    /// Creates an unlocked mutex.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS semaphores cannot be created.
    pub fn new() -> Result<Self, Error> {
        Self::with_platform()
    }
}

impl<S: PlatformSemaphore> SharedMutex<S> {
    /// Creates an unlocked mutex parking on `S`.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform semaphores cannot be created.
    pub fn with_platform() -> Result<Self, Error> {
        Ok(SharedMutex {
            state: CachePadded::new(AtomicU64::new(0)),
            read_sema: Semaphore::with_platform(0)?,
            write_sema: Semaphore::with_platform(0)?,
        })
    }

    fn load(&self) -> State {
        State(self.state.load(Relaxed))
    }

    /// Applies `f` to the state word until the CAS succeeds, returning the
    /// state before the transition.
    fn transition(&self, success: core::sync::atomic::Ordering, f: impl Fn(State) -> State) -> State {
        let mut old = self.load();
        loop {
            let new = f(old);
            match self
                .state
                .compare_exchange_weak(old.0, new.0, success, Relaxed)
            {
                Ok(_) => break old,
                Err(e) => old = State(e),
            }
        }
    }

    /// Acquires the lock exclusively, blocking while any reader or other
    /// writer holds it.
    pub fn lock(&self) {
        let old = self.transition(Acquire, |old| {
            assert!(old.writers() < State::MAX_WRITERS, "too many writers");
            old.with_writers(old.writers() + 1)
        });
        if old.readers() > 0 || old.writers() > 0 {
            self.write_sema.wait();
        }
    }

    /// Acquires the lock exclusively if it is completely idle.
    pub fn try_lock(&self) -> bool {
        let locked = State(0).with_writers(1);
        self.state
            .compare_exchange(0, locked.0, Acquire, Relaxed)
            .is_ok()
    }

    /// Releases the exclusive lock.
    ///
    /// Readers that queued up behind the writer become active all at once;
    /// otherwise the next queued writer, if any, takes over.
    ///
    /// # Safety
    ///
    /// The current context must hold the exclusive lock, acquired by
    /// [`lock`](Self::lock) or a successful [`try_lock`](Self::try_lock).
    pub unsafe fn unlock(&self) {
        let old = self.transition(Release, |old| {
            assert!(old.writers() > 0, "unlocking a mutex not exclusively locked");
            debug_assert_eq!(old.readers(), 0, "{old:?}");
            let new = old.with_writers(old.writers() - 1);
            match old.waiting() {
                0 => new,
                waiting => new.with_waiting(0).with_readers(waiting),
            }
        });
        match old.waiting() {
            0 if old.writers() > 1 => self.write_sema.signal(1),
            0 => {}
            waiting => self.read_sema.signal(waiting as u32),
        }
    }

    /// Acquires the lock in shared mode, blocking while a writer is active
    /// or queued.
    pub fn lock_shared(&self) {
        let old = self.transition(Acquire, |old| {
            if old.writers() > 0 {
                assert!(old.waiting() < State::MAX_WAITING, "too many waiting readers");
                old.with_waiting(old.waiting() + 1)
            } else {
                assert!(old.readers() < State::MAX_READERS, "too many readers");
                old.with_readers(old.readers() + 1)
            }
        });
        if old.writers() > 0 {
            self.read_sema.wait();
        }
    }

    /// Acquires the lock in shared mode if no writer is active or queued.
    pub fn try_lock_shared(&self) -> bool {
        let mut old = self.load();
        loop {
            if old.writers() > 0 {
                break false;
            }
            assert!(old.readers() < State::MAX_READERS, "too many readers");
            let new = old.with_readers(old.readers() + 1);
            match self
                .state
                .compare_exchange_weak(old.0, new.0, Acquire, Relaxed)
            {
                Ok(_) => break true,
                Err(e) => old = State(e),
            }
        }
    }

    /// Releases a shared lock, waking a queued writer if this was the last
    /// reader.
    ///
    /// # Safety
    ///
    /// The current context must hold a shared lock, acquired by
    /// [`lock_shared`](Self::lock_shared) or a successful
    /// [`try_lock_shared`](Self::try_lock_shared).
    pub unsafe fn unlock_shared(&self) {
        let old = self.transition(Release, |old| {
            assert!(old.readers() > 0, "unlocking a mutex not locked shared");
            old.with_readers(old.readers() - 1)
        });
        if old.readers() == 1 && old.writers() > 0 {
            self.write_sema.signal(1);
        }
    }

    /// Acquires the lock exclusively, releasing it when the guard drops.
    pub fn write(&self) -> ExclusiveGuard<'_, S> {
        self.lock();
        ExclusiveGuard { mutex: self }
    }

    /// Attempts to acquire the lock exclusively without blocking.
    pub fn try_write(&self) -> Option<ExclusiveGuard<'_, S>> {
        self.try_lock().then(|| ExclusiveGuard { mutex: self })
    }

    /// Acquires the lock in shared mode, releasing it when the guard drops.
    pub fn read(&self) -> SharedGuard<'_, S> {
        self.lock_shared();
        SharedGuard { mutex: self }
    }

    /// Attempts to acquire the lock in shared mode without blocking.
    pub fn try_read(&self) -> Option<SharedGuard<'_, S>> {
        self.try_lock_shared().then(|| SharedGuard { mutex: self })
    }
}

impl<S: PlatformSemaphore> fmt::Debug for SharedMutex<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMutex")
            .field("state", &self.load())
            .finish_non_exhaustive()
    }
}

/// An exclusive lock on a [`SharedMutex`].
#[must_use = "the lock is released immediately if the guard is unused"]
pub struct ExclusiveGuard<'a, S: PlatformSemaphore = OsSemaphore> {
    mutex: &'a SharedMutex<S>,
}

impl<S: PlatformSemaphore> Drop for ExclusiveGuard<'_, S> {
    fn drop(&mut self) {
        // SAFETY: the guard is only created with the exclusive lock held.
        unsafe { self.mutex.unlock() }
    }
}

/// A shared lock on a [`SharedMutex`].
#[must_use = "the lock is released immediately if the guard is unused"]
pub struct SharedGuard<'a, S: PlatformSemaphore = OsSemaphore> {
    mutex: &'a SharedMutex<S>,
}

impl<S: PlatformSemaphore> Drop for SharedGuard<'_, S> {
    fn drop(&mut self) {
        // SAFETY: the guard is only created with a shared lock held.
        unsafe { self.mutex.unlock_shared() }
    }
}

/// A reader-writer lock protecting a value, backed by a [`SharedMutex`].
pub struct RwLock<T: ?Sized, S: PlatformSemaphore = OsSemaphore> {
    raw: SharedMutex<S>,
    value: UnsafeCell<T>,
}

// SAFETY: the value is only reachable through the guards, which follow the
// single-writer-multiple-reader discipline of `raw`.
unsafe impl<T: ?Sized + Send, S: PlatformSemaphore> Send for RwLock<T, S> {}
unsafe impl<T: ?Sized + Send + Sync, S: PlatformSemaphore> Sync for RwLock<T, S> {}

impl<T> RwLock<T> {
    /// Creates an unlocked lock protecting `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS semaphores cannot be created.
    pub fn new(value: T) -> Result<Self, Error> {
        Self::with_platform(value)
    }
}

impl<T, S: PlatformSemaphore> RwLock<T, S> {
    /// Creates an unlocked lock protecting `value`, parking on `S`.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform semaphores cannot be created.
    pub fn with_platform(value: T) -> Result<Self, Error> {
        Ok(RwLock {
            raw: SharedMutex::with_platform()?,
            value: UnsafeCell::new(value),
        })
    }

    /// Consumes the lock, returning the protected value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized, S: PlatformSemaphore> RwLock<T, S> {
    /// Locks for reading, blocking while a writer is active or queued.
    pub fn read(&self) -> ReadGuard<'_, T, S> {
        self.raw.lock_shared();
        ReadGuard { lock: self }
    }

    /// Locks for reading if no writer is active or queued.
    pub fn try_read(&self) -> Option<ReadGuard<'_, T, S>> {
        self.raw.try_lock_shared().then(|| ReadGuard { lock: self })
    }

    /// Locks for writing, blocking while anyone else holds the lock.
    pub fn write(&self) -> WriteGuard<'_, T, S> {
        self.raw.lock();
        WriteGuard { lock: self }
    }

    /// Locks for writing if the lock is completely idle.
    pub fn try_write(&self) -> Option<WriteGuard<'_, T, S>> {
        self.raw.try_lock().then(|| WriteGuard { lock: self })
    }

    /// Gets the value mutably; no locking is needed since the borrow is
    /// exclusive.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Retrieves the raw lock.
    pub fn raw(&self) -> &SharedMutex<S> {
        &self.raw
    }
}

impl<T: ?Sized + fmt::Debug, S: PlatformSemaphore> fmt::Debug for RwLock<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RwLock");
        match self.try_read() {
            Some(guard) => d.field("value", &&*guard),
            None => d.field("value", &format_args!("<locked>")),
        };
        d.finish()
    }
}

/// A shared borrow of the value in a [`RwLock`].
#[must_use = "the lock is released immediately if the guard is unused"]
pub struct ReadGuard<'a, T: ?Sized, S: PlatformSemaphore = OsSemaphore> {
    lock: &'a RwLock<T, S>,
}

impl<T: ?Sized, S: PlatformSemaphore> Deref for ReadGuard<'_, T, S> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a shared lock is held, so no writer exists.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized, S: PlatformSemaphore> Drop for ReadGuard<'_, T, S> {
    fn drop(&mut self) {
        // SAFETY: the guard is only created with a shared lock held.
        unsafe { self.lock.raw.unlock_shared() }
    }
}

/// An exclusive borrow of the value in a [`RwLock`].
#[must_use = "the lock is released immediately if the guard is unused"]
pub struct WriteGuard<'a, T: ?Sized, S: PlatformSemaphore = OsSemaphore> {
    lock: &'a RwLock<T, S>,
}

impl<T: ?Sized, S: PlatformSemaphore> Deref for WriteGuard<'_, T, S> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the exclusive lock is held.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized, S: PlatformSemaphore> DerefMut for WriteGuard<'_, T, S> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the exclusive lock is held.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized, S: PlatformSemaphore> Drop for WriteGuard<'_, T, S> {
    fn drop(&mut self) {
        // SAFETY: the guard is only created with the exclusive lock held.
        unsafe { self.lock.raw.unlock() }
    }
}

#[cfg(test)]
mod test {
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::atomic::{AtomicBool, AtomicUsize, Ordering::*},
        thread,
        time::Duration,
    };

    use super::{RwLock, SharedMutex, State};
    use crate::os::Portable;

    #[test]
    fn packing() {
        let state = State(0).with_readers(3).with_writers(2).with_waiting(1);
        assert_eq!((state.readers(), state.writers(), state.waiting()), (3, 2, 1));

        let full = State(0)
            .with_readers(State::MAX_READERS)
            .with_writers(State::MAX_WRITERS)
            .with_waiting(State::MAX_WAITING);
        assert_eq!(full.0, u64::MAX);
        assert_eq!(full.with_writers(0).writers(), 0);
        assert_eq!(full.with_writers(0).readers(), State::MAX_READERS);
    }

    #[test]
    fn exclusion() {
        const READERS: usize = 4;
        let mutex = SharedMutex::new().unwrap();

        let guards: Vec<_> = (0..READERS).map(|_| mutex.read()).collect();
        assert!(mutex.try_write().is_none());
        assert!(mutex.try_read().is_some());
        drop(guards);

        let write = mutex.write();
        assert!(mutex.try_read().is_none());
        assert!(mutex.try_write().is_none());
        drop(write);

        assert!(mutex.try_write().is_some());
    }

    #[test]
    fn readers_coexist() {
        const READERS: usize = 6;
        let mutex = SharedMutex::new().unwrap();
        let inside = AtomicUsize::new(0);
        let all_in = AtomicBool::new(false);

        thread::scope(|s| {
            for _ in 0..READERS {
                s.spawn(|| {
                    let _guard = mutex.read();
                    inside.fetch_add(1, AcqRel);
                    while !all_in.load(Acquire) {
                        thread::yield_now();
                    }
                });
            }
            while inside.load(Acquire) < READERS {
                thread::yield_now();
            }
            assert!(!mutex.try_lock());
            all_in.store(true, Release);
        });

        assert!(mutex.try_lock());
        // SAFETY: just locked above.
        unsafe { mutex.unlock() };
    }

    #[test]
    fn writer_waits_for_readers() {
        let mutex = SharedMutex::new().unwrap();
        let written = AtomicBool::new(false);

        let read = mutex.read();
        thread::scope(|s| {
            s.spawn(|| {
                let _guard = mutex.write();
                written.store(true, Release);
            });
            thread::sleep(Duration::from_millis(30));
            assert!(!written.load(Acquire));
            // A queued writer blocks new readers.
            assert!(mutex.try_read().is_none());
            drop(read);
        });
        assert!(written.load(Acquire));
    }

    #[test]
    fn waiting_readers_promoted() {
        const READERS: usize = 4;
        let mutex = SharedMutex::new().unwrap();
        let entered = AtomicUsize::new(0);

        let write = mutex.write();
        thread::scope(|s| {
            for _ in 0..READERS {
                s.spawn(|| {
                    let _guard = mutex.read();
                    entered.fetch_add(1, AcqRel);
                });
            }
            while mutex.load().waiting() < READERS as u64 {
                thread::yield_now();
            }
            assert_eq!(entered.load(Acquire), 0);
            drop(write);
        });
        assert_eq!(entered.load(Acquire), READERS);
        assert_eq!(mutex.load(), State(0));
    }

    #[test]
    fn counter() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 2000;
        let lock = RwLock::new(0usize).unwrap();

        thread::scope(|s| {
            for tid in 0..THREADS {
                let lock = &lock;
                s.spawn(move || {
                    for round in 0..ROUNDS {
                        if (tid + round) % 4 == 0 {
                            *lock.write() += 1;
                        } else {
                            let value = *lock.read();
                            assert!(value <= THREADS * ROUNDS);
                        }
                    }
                });
            }
        });

        let writes = (0..THREADS)
            .map(|tid| (0..ROUNDS).filter(|round| (tid + round) % 4 == 0).count())
            .sum::<usize>();
        assert_eq!(lock.into_inner(), writes);
    }

    #[test]
    #[should_panic = "not locked shared"]
    fn unbalanced_unlock() {
        let mutex = SharedMutex::new().unwrap();
        // SAFETY: the precondition is deliberately broken to test the check.
        unsafe { mutex.unlock_shared() };
    }

    #[test]
    fn portable_backend() {
        let lock = RwLock::<_, Portable>::with_platform(vec![1, 2]).unwrap();
        thread::scope(|s| {
            s.spawn(|| lock.write().push(3));
            s.spawn(|| assert!(lock.read().len() >= 2));
        });
        assert_eq!(lock.into_inner(), [1, 2, 3]);
    }

    /// Runs `op` on a mutex preloaded with `state`, expecting it to panic
    /// without touching the state word.
    fn overflows(state: State, op: impl FnOnce(&SharedMutex)) {
        let mutex = SharedMutex::new().unwrap();
        mutex.state.store(state.0, Relaxed);
        let result = panic::catch_unwind(AssertUnwindSafe(|| op(&mutex)));
        assert!(result.is_err(), "{state:?} should overflow");
        assert_eq!(mutex.load(), state);
    }

    #[test]
    fn overflow_leaves_state() {
        overflows(State(0).with_readers(State::MAX_READERS), |m| m.lock_shared());
        overflows(State(0).with_readers(State::MAX_READERS), |m| {
            m.try_lock_shared();
        });
        overflows(State(0).with_writers(State::MAX_WRITERS), |m| m.lock());
        let waiting = State(0).with_writers(1).with_waiting(State::MAX_WAITING);
        overflows(waiting, |m| m.lock_shared());
    }

    #[test]
    #[should_panic = "too many readers"]
    fn reader_overflow() {
        let mutex = SharedMutex::new().unwrap();
        let full = State(0).with_readers(State::MAX_READERS);
        mutex.state.store(full.0, Relaxed);
        mutex.lock_shared();
    }

    #[test]
    #[should_panic = "too many writers"]
    fn writer_overflow() {
        let mutex = SharedMutex::new().unwrap();
        let full = State(0).with_writers(State::MAX_WRITERS);
        mutex.state.store(full.0, Relaxed);
        mutex.lock();
    }
}
