//! The module of events.
//!
//! An [`Event`] stays signaled until reset; an [`AutoResetEvent`] releases a
//! single waiter per signal.

use core::{
    sync::atomic::{AtomicIsize, Ordering::*},
    time::Duration,
};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::{
    os::{Error, OsSemaphore, PlatformSemaphore},
    sema::Semaphore,
};

/// A sticky notification.
///
/// Once [`set`](Event::set), every current and future waiter passes until the
/// event is [`reset`](Event::reset).
#[derive(Debug, Default)]
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    /// Creates an event, optionally already set.
    pub const fn new(set: bool) -> Self {
        Event {
            state: Mutex::new(set),
            cond: Condvar::new(),
        }
    }

    /// Sets the event and wakes all the waiters.
    pub fn set(&self) {
        *self.state.lock() = true;
        self.cond.notify_all();
    }

    /// Clears the event.
    pub fn reset(&self) {
        *self.state.lock() = false;
    }

    /// Whether the event is currently set.
    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Blocks until the event is set.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !*state {
            self.cond.wait(&mut state);
        }
    }

    /// Blocks at most `timeout` until the event is set.
    ///
    /// Returns whether the event is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut state = self.state.lock();
        while !*state {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state
    }
}

/// A notification that resets itself after releasing one waiter.
///
/// The status is an integer in `[-waiters, 1]`: `1` means one signal is
/// pending, and a negative value counts the threads parked on the inner
/// semaphore. Signals never accumulate beyond one.
///
/// # Examples
///
/// ```rust
/// use basis_sync::AutoResetEvent;
///
/// let event = AutoResetEvent::new(false).unwrap();
/// event.signal();
/// event.signal();
/// assert!(event.try_wait());
/// assert!(!event.try_wait());
/// ```
#[derive(Debug)]
pub struct AutoResetEvent<S: PlatformSemaphore = OsSemaphore> {
    status: AtomicIsize,
    sema: Semaphore<S>,
}

impl AutoResetEvent {
    /// Creates an event, optionally holding a pending signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS semaphore cannot be created.
    pub fn new(set: bool) -> Result<Self, Error> {
        Self::with_platform(set)
    }
}

impl<S: PlatformSemaphore> AutoResetEvent<S> {
    /// Creates an event parking on `S`, optionally holding a pending signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform semaphore cannot be created.
    pub fn with_platform(set: bool) -> Result<Self, Error> {
        Ok(AutoResetEvent {
            status: AtomicIsize::new(set as isize),
            sema: Semaphore::with_platform(0)?,
        })
    }

    /// Releases one waiter, or leaves one pending signal if nobody waits.
    pub fn signal(&self) {
        let mut old = self.status.load(Relaxed);
        loop {
            debug_assert!(old <= 1);
            let new = if old < 1 { old + 1 } else { 1 };
            match self
                .status
                .compare_exchange_weak(old, new, Release, Relaxed)
            {
                Ok(_) => break,
                Err(e) => old = e,
            }
        }
        if old < 0 {
            self.sema.signal(1);
        }
    }

    /// Blocks until signaled, consuming the signal.
    pub fn wait(&self) {
        let old = self.status.fetch_sub(1, Acquire);
        debug_assert!(old <= 1);
        if old < 1 {
            self.sema.wait();
        }
    }

    /// Consumes a pending signal without blocking.
    pub fn try_wait(&self) -> bool {
        self.status
            .compare_exchange(1, 0, Acquire, Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering::*},
        thread,
        time::Duration,
    };

    use super::{AutoResetEvent, Event};
    use crate::os::Portable;

    #[test]
    fn sticky() {
        let event = Event::new(false);
        assert!(!event.wait_timeout(Duration::from_millis(10)));

        thread::scope(|s| {
            let waiters: Vec<_> = (0..4).map(|_| s.spawn(|| event.wait())).collect();
            thread::sleep(Duration::from_millis(20));
            event.set();
            waiters.into_iter().for_each(|w| w.join().unwrap());
        });

        assert!(event.is_set());
        event.wait();
        event.reset();
        assert!(!event.is_set());
        assert!(!event.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn auto_reset_coalesces() {
        let event = AutoResetEvent::new(true).unwrap();
        event.signal();
        assert!(event.try_wait());
        assert!(!event.try_wait());
    }

    #[test]
    fn auto_reset_releases_one_each() {
        const THREADS: usize = 4;
        let event = AutoResetEvent::new(false).unwrap();
        let passed = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    event.wait();
                    passed.fetch_add(1, AcqRel);
                });
            }
            for released in 1..=THREADS {
                event.signal();
                while passed.load(Acquire) < released {
                    thread::yield_now();
                }
            }
        });
        assert_eq!(passed.load(Acquire), THREADS);
        assert!(!event.try_wait());
    }

    #[test]
    fn auto_reset_on_portable() {
        let event = AutoResetEvent::<Portable>::with_platform(false).unwrap();
        thread::scope(|s| {
            let waiter = s.spawn(|| event.wait());
            thread::sleep(Duration::from_millis(10));
            event.signal();
            waiter.join().unwrap();
        });
        assert!(!event.try_wait());
    }
}
