use core::time::Duration;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::{Error, PlatformSemaphore};

/// A semaphore made of a mutex and a condition variable.
///
/// Used on targets without a native semaphore, and handy in tests since it
/// never fails to be created.
#[derive(Debug, Default)]
pub struct Portable {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Portable {
    /// Creates a semaphore holding `initial` signals.
    pub const fn with_count(initial: u32) -> Self {
        Portable {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }
}

impl PlatformSemaphore for Portable {
    fn new(initial: u32) -> Result<Self, Error> {
        Ok(Self::with_count(initial))
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        let ret = *count > 0;
        if ret {
            *count -= 1;
        }
        ret
    }

    fn timed_wait(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    fn signal(&self, count: u32) {
        let mut cur = self.count.lock();
        *cur = cur.checked_add(count).expect("semaphore count overflow");
        drop(cur);
        match count {
            0 => {}
            1 => {
                self.cond.notify_one();
            }
            _ => {
                self.cond.notify_all();
            }
        }
    }
}
