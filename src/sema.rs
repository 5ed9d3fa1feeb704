//! The module of hybrid semaphores.
//!
//! See [`Semaphore`] for more information.

use core::{
    hint,
    sync::atomic::{AtomicIsize, Ordering::*},
    time::Duration,
};

use crossbeam_utils::CachePadded;

use crate::{
    config::SPIN_COUNT,
    os::{Error, OsSemaphore, PlatformSemaphore},
};

/// A counting semaphore that avoids system calls when uncontended.
///
/// The semaphore keeps a signed counter in front of an OS semaphore:
///
/// - a positive count is the number of available signals;
/// - a negative count is the number of threads parked (or about to park) on
///   the OS semaphore.
///
/// A waiter first spins on the counter for [`SPIN_COUNT`] iterations, and
/// only then reserves a signal and parks. A signaler only issues as many OS
/// wake-ups as there are parked threads.
///
/// # Examples
///
/// ```rust
/// use basis_sync::Semaphore;
///
/// let sema = Semaphore::new(0).unwrap();
/// sema.signal(2);
/// sema.wait();
/// assert!(sema.try_wait());
/// assert!(!sema.try_wait());
/// ```
#[derive(Debug)]
pub struct Semaphore<S: PlatformSemaphore = OsSemaphore> {
    count: CachePadded<AtomicIsize>,
    sema: S,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` signals, parking on the native
    /// semaphore of the target.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS semaphore cannot be created.
    pub fn new(initial: u32) -> Result<Self, Error> {
        Self::with_platform(initial)
    }
}

impl<S: PlatformSemaphore> Semaphore<S> {
    /// Creates a semaphore holding `initial` signals, parking on `S`.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform semaphore cannot be created.
    pub fn with_platform(initial: u32) -> Result<Self, Error> {
        Ok(Semaphore {
            count: CachePadded::new(AtomicIsize::new(initial as isize)),
            sema: S::new(0)?,
        })
    }

    /// Consumes a signal if one is available, without blocking.
    pub fn try_wait(&self) -> bool {
        let mut old = self.count.load(Relaxed);
        while old > 0 {
            match self
                .count
                .compare_exchange_weak(old, old - 1, Acquire, Relaxed)
            {
                Ok(_) => return true,
                Err(e) => old = e,
            }
        }
        false
    }

    /// Blocks until a signal is available and consumes it.
    pub fn wait(&self) {
        if !self.try_wait() {
            let _ret = self.wait_with_partial_spinning(None);
            debug_assert!(_ret);
        }
    }

    /// Blocks at most `timeout` for a signal.
    ///
    /// Returns `false` if the timeout elapsed without consuming a signal.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        self.try_wait() || self.wait_with_partial_spinning(Some(timeout))
    }

    #[cold]
    fn wait_with_partial_spinning(&self, timeout: Option<Duration>) -> bool {
        for _ in 0..SPIN_COUNT {
            let old = self.count.load(Relaxed);
            if old > 0
                && self
                    .count
                    .compare_exchange(old, old - 1, Acquire, Relaxed)
                    .is_ok()
            {
                return true;
            }
            hint::spin_loop();
        }

        let old = self.count.fetch_sub(1, Acquire);
        if old > 0 {
            return true;
        }

        let Some(timeout) = timeout else {
            self.sema.wait();
            return true;
        };
        if self.sema.timed_wait(timeout) {
            return true;
        }

        // We timed out but are still counted as a waiter. Either a signaler
        // has already counted us in, in which case its wake-up is on its way
        // to the OS semaphore, or we take ourselves out of the count.
        loop {
            let old = self.count.load(Acquire);
            if old >= 0 && self.sema.try_wait() {
                return true;
            }
            if old < 0
                && self
                    .count
                    .compare_exchange(old, old + 1, Relaxed, Relaxed)
                    .is_ok()
            {
                return false;
            }
            hint::spin_loop();
        }
    }

    /// Adds `count` signals, waking up to `count` parked threads.
    pub fn signal(&self, count: u32) {
        let count = count as isize;
        let old = self.count.fetch_add(count, Release);
        let to_release = (-old).min(count);
        if to_release > 0 {
            self.sema.signal(to_release as u32);
        }
    }

    /// A racy snapshot of the counter: available signals if positive, the
    /// number of waiters if negative.
    pub fn available(&self) -> isize {
        self.count.load(Relaxed)
    }
}
