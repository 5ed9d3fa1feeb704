#![allow(non_camel_case_types)]

use core::{ffi::c_int, fmt, time::Duration};
use std::time::Instant;

use errno::Errno;

use super::{Error, PlatformSemaphore, fatal};

type mach_port_t = u32;
type semaphore_t = mach_port_t;
type kern_return_t = c_int;

#[repr(C)]
#[derive(Clone, Copy)]
struct mach_timespec_t {
    tv_sec: u32,
    tv_nsec: c_int,
}

const KERN_SUCCESS: kern_return_t = 0;
const KERN_ABORTED: kern_return_t = 14;
const KERN_OPERATION_TIMED_OUT: kern_return_t = 49;
const SYNC_POLICY_FIFO: c_int = 0;

unsafe extern "C" {
    static mach_task_self_: mach_port_t;

    fn semaphore_create(
        task: mach_port_t,
        semaphore: *mut semaphore_t,
        policy: c_int,
        value: c_int,
    ) -> kern_return_t;
    fn semaphore_destroy(task: mach_port_t, semaphore: semaphore_t) -> kern_return_t;
    fn semaphore_signal(semaphore: semaphore_t) -> kern_return_t;
    fn semaphore_wait(semaphore: semaphore_t) -> kern_return_t;
    fn semaphore_timedwait(semaphore: semaphore_t, wait_time: mach_timespec_t) -> kern_return_t;
}

fn task_self() -> mach_port_t {
    // SAFETY: `mach_task_self_` is initialized by the runtime before `main`.
    unsafe { mach_task_self_ }
}

/// A Mach kernel semaphore.
///
/// Apple platforms don't implement unnamed POSIX semaphores, so this is the
/// native choice there.
pub struct Mach {
    sem: semaphore_t,
}

impl Mach {
    fn wait_for(&self, timeout: Duration) -> kern_return_t {
        let wait_time = mach_timespec_t {
            tv_sec: timeout.as_secs().try_into().unwrap_or(u32::MAX),
            tv_nsec: timeout.subsec_nanos() as c_int,
        };
        // SAFETY: the semaphore is alive.
        unsafe { semaphore_timedwait(self.sem, wait_time) }
    }
}

impl PlatformSemaphore for Mach {
    fn new(initial: u32) -> Result<Self, Error> {
        let mut sem = 0;
        let initial = initial.min(c_int::MAX as u32) as c_int;
        // SAFETY: `sem` is a valid slot to receive the port name.
        let ret = unsafe { semaphore_create(task_self(), &mut sem, SYNC_POLICY_FIFO, initial) };
        if ret != KERN_SUCCESS {
            return Err(Error::Create(Errno(ret)));
        }
        Ok(Mach { sem })
    }

    fn wait(&self) {
        loop {
            // SAFETY: the semaphore is alive.
            match unsafe { semaphore_wait(self.sem) } {
                KERN_SUCCESS => return,
                KERN_ABORTED => continue,
                ret => fatal("semaphore_wait", Errno(ret)),
            }
        }
    }

    fn try_wait(&self) -> bool {
        self.timed_wait(Duration::ZERO)
    }

    fn timed_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut remaining = timeout;
        loop {
            match self.wait_for(remaining) {
                KERN_SUCCESS => return true,
                KERN_OPERATION_TIMED_OUT => return false,
                KERN_ABORTED => match deadline {
                    Some(deadline) => {
                        remaining = deadline.saturating_duration_since(Instant::now());
                    }
                    None => continue,
                },
                ret => fatal("semaphore_timedwait", Errno(ret)),
            }
        }
    }

    fn signal(&self, count: u32) {
        for _ in 0..count {
            // SAFETY: the semaphore is alive.
            let ret = unsafe { semaphore_signal(self.sem) };
            if ret != KERN_SUCCESS {
                fatal("semaphore_signal", Errno(ret))
            }
        }
    }
}

impl fmt::Debug for Mach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mach").field("sem", &self.sem).finish()
    }
}

impl Drop for Mach {
    fn drop(&mut self) {
        // SAFETY: we own the semaphore exclusively.
        unsafe { semaphore_destroy(task_self(), self.sem) };
    }
}
