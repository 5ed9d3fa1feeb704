use core::{cell::UnsafeCell, fmt, mem, time::Duration};

use errno::errno;

use super::{Error, PlatformSemaphore, fatal};

/// An unnamed POSIX semaphore (`sem_t`).
///
/// `sem_t` must not move after `sem_init`, so it lives in its own heap
/// allocation.
pub struct Posix {
    sem: Box<UnsafeCell<libc::sem_t>>,
}

// SAFETY: `sem_t` is designed to be shared among threads, and all accesses go
// through the `sem_*` functions.
unsafe impl Send for Posix {}
unsafe impl Sync for Posix {}

impl Posix {
    fn as_ptr(&self) -> *mut libc::sem_t {
        self.sem.get()
    }

    fn deadline(timeout: Duration) -> libc::timespec {
        const NANOS_PER_SEC: i64 = 1_000_000_000;

        // SAFETY: `timespec` is plain old data.
        let mut now: libc::timespec = unsafe { mem::zeroed() };
        // SAFETY: `now` is a valid `timespec` to write into.
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

        let nanos = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
        let secs = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
        let secs = (now.tv_sec as i64)
            .saturating_add(secs)
            .saturating_add(nanos / NANOS_PER_SEC);

        // SAFETY: `timespec` is plain old data.
        let mut deadline: libc::timespec = unsafe { mem::zeroed() };
        deadline.tv_sec = secs.try_into().unwrap_or(libc::time_t::MAX);
        deadline.tv_nsec = (nanos % NANOS_PER_SEC) as _;
        deadline
    }
}

impl PlatformSemaphore for Posix {
    fn new(initial: u32) -> Result<Self, Error> {
        // SAFETY: `sem_t` is plain old data, initialized right below.
        let sem = Box::new(UnsafeCell::new(unsafe { mem::zeroed::<libc::sem_t>() }));
        // SAFETY: `sem` points to a pinned, owned `sem_t`.
        if unsafe { libc::sem_init(sem.get(), 0, initial as libc::c_uint) } != 0 {
            return Err(Error::Create(errno()));
        }
        Ok(Posix { sem })
    }

    fn wait(&self) {
        loop {
            // SAFETY: the semaphore is initialized.
            if unsafe { libc::sem_wait(self.as_ptr()) } == 0 {
                return;
            }
            let err = errno();
            if err.0 != libc::EINTR {
                fatal("sem_wait", err)
            }
        }
    }

    fn try_wait(&self) -> bool {
        loop {
            // SAFETY: the semaphore is initialized.
            if unsafe { libc::sem_trywait(self.as_ptr()) } == 0 {
                return true;
            }
            match errno() {
                err if err.0 == libc::EINTR => continue,
                err if err.0 == libc::EAGAIN => return false,
                err => fatal("sem_trywait", err),
            }
        }
    }

    fn timed_wait(&self, timeout: Duration) -> bool {
        let deadline = Self::deadline(timeout);
        loop {
            // SAFETY: the semaphore is initialized.
            if unsafe { libc::sem_timedwait(self.as_ptr(), &deadline) } == 0 {
                return true;
            }
            match errno() {
                err if err.0 == libc::EINTR => continue,
                err if err.0 == libc::ETIMEDOUT => return false,
                err => fatal("sem_timedwait", err),
            }
        }
    }

    fn signal(&self, count: u32) {
        for _ in 0..count {
            // SAFETY: the semaphore is initialized.
            if unsafe { libc::sem_post(self.as_ptr()) } != 0 {
                fatal("sem_post", errno())
            }
        }
    }
}

impl fmt::Debug for Posix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Posix").field("sem", &self.as_ptr()).finish()
    }
}

impl Drop for Posix {
    fn drop(&mut self) {
        // SAFETY: no thread can be blocked on the semaphore while we own it
        // exclusively.
        unsafe { libc::sem_destroy(self.as_ptr()) };
    }
}
