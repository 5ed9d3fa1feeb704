//! The module of OS semaphores.
//!
//! See [`PlatformSemaphore`] for more information.

#[cfg(target_vendor = "apple")]
mod mach;
mod portable;
#[cfg(all(unix, not(target_vendor = "apple")))]
mod posix;
#[cfg(windows)]
mod win32;

use core::{fmt, time::Duration};

pub use errno::Errno;

#[cfg(target_vendor = "apple")]
pub use self::mach::Mach;
pub use self::portable::Portable;
#[cfg(all(unix, not(target_vendor = "apple")))]
pub use self::posix::Posix;
#[cfg(windows)]
pub use self::win32::Win32;

/// The native semaphore of the current target.
#[cfg(all(unix, not(target_vendor = "apple")))]
pub type OsSemaphore = Posix;
/// The native semaphore of the current target.
#[cfg(target_vendor = "apple")]
pub type OsSemaphore = Mach;
/// The native semaphore of the current target.
#[cfg(windows)]
pub type OsSemaphore = Win32;
/// The native semaphore of the current target.
#[cfg(not(any(unix, windows)))]
pub type OsSemaphore = Portable;

/// The trait of blocking counting semaphores provided by the operating
/// system.
///
/// Every portable primitive of this crate ([`Semaphore`](crate::Semaphore),
/// [`AutoResetEvent`](crate::AutoResetEvent),
/// [`SharedMutex`](crate::SharedMutex)) parks its threads through this trait
/// only, so a target needs nothing more than one implementation of it.
///
/// Failures other than interruptions and timeouts after a successful
/// creation mean the semaphore is corrupted, and are reported by panicking.
pub trait PlatformSemaphore: Sized + Send + Sync {
    /// Creates a semaphore holding `initial` signals.
    ///
    /// # Errors
    ///
    /// Returns the platform error code if the OS refuses to create one.
    fn new(initial: u32) -> Result<Self, Error>;

    /// Blocks until a signal is available and consumes it.
    fn wait(&self);

    /// Consumes a signal if one is available, without blocking.
    fn try_wait(&self) -> bool;

    /// Blocks at most `timeout` for a signal.
    ///
    /// Returns `false` if the timeout elapsed without consuming a signal.
    fn timed_wait(&self, timeout: Duration) -> bool;

    /// Adds `count` signals, waking up to `count` blocked threads.
    fn signal(&self, count: u32);
}

/// The errors of OS semaphores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// The OS refused to create the semaphore.
    Create(Errno),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Create(errno) => write!(f, "failed to create an OS semaphore: {errno}"),
        }
    }
}

impl std::error::Error for Error {}

#[cold]
#[allow(dead_code)]
fn fatal(op: &str, errno: Errno) -> ! {
    report!(error, "{op} failed on a live semaphore: {errno}");
    panic!("{op} failed on a live semaphore: {errno}")
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering::*},
        thread,
        time::{Duration, Instant},
    };

    use super::{OsSemaphore, PlatformSemaphore, Portable};

    fn counting<S: PlatformSemaphore>() {
        let sema = S::new(2).unwrap();
        assert!(sema.try_wait());
        assert!(sema.try_wait());
        assert!(!sema.try_wait());

        sema.signal(3);
        sema.wait();
        sema.wait();
        sema.wait();
        assert!(!sema.try_wait());
    }

    fn timeout<S: PlatformSemaphore>() {
        let sema = S::new(0).unwrap();
        let start = Instant::now();
        assert!(!sema.timed_wait(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));

        sema.signal(1);
        assert!(sema.timed_wait(Duration::from_millis(20)));
    }

    fn wake<S: PlatformSemaphore>() {
        const THREADS: usize = 4;
        let sema = S::new(0).unwrap();
        let woken = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    sema.wait();
                    woken.fetch_add(1, Relaxed);
                });
            }
            sema.signal(THREADS as u32);
        });
        assert_eq!(woken.load(Relaxed), THREADS);
    }

    #[test]
    fn native() {
        counting::<OsSemaphore>();
        timeout::<OsSemaphore>();
        wake::<OsSemaphore>();
    }

    #[test]
    fn portable() {
        counting::<Portable>();
        timeout::<Portable>();
        wake::<Portable>();
    }
}
