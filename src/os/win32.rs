use core::{fmt, ptr, time::Duration};

use errno::errno;
use windows_sys::Win32::{
    Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT},
    System::Threading::{CreateSemaphoreW, INFINITE, ReleaseSemaphore, WaitForSingleObject},
};

use super::{Error, PlatformSemaphore, fatal};

/// A Win32 semaphore object.
pub struct Win32 {
    handle: HANDLE,
}

// SAFETY: kernel object handles can be used from any thread.
unsafe impl Send for Win32 {}
unsafe impl Sync for Win32 {}

impl Win32 {
    fn wait_ms(&self, millis: u32) -> bool {
        // SAFETY: the handle is alive.
        match unsafe { WaitForSingleObject(self.handle, millis) } {
            WAIT_OBJECT_0 => true,
            WAIT_TIMEOUT => false,
            _ => fatal("WaitForSingleObject", errno()),
        }
    }
}

impl PlatformSemaphore for Win32 {
    fn new(initial: u32) -> Result<Self, Error> {
        let initial = initial.min(i32::MAX as u32) as i32;
        // SAFETY: null attributes and names are allowed.
        let handle = unsafe { CreateSemaphoreW(ptr::null(), initial, i32::MAX, ptr::null()) };
        if handle.is_null() {
            return Err(Error::Create(errno()));
        }
        Ok(Win32 { handle })
    }

    fn wait(&self) {
        let _signaled = self.wait_ms(INFINITE);
        debug_assert!(_signaled);
    }

    fn try_wait(&self) -> bool {
        self.wait_ms(0)
    }

    fn timed_wait(&self, timeout: Duration) -> bool {
        let millis = timeout.as_millis().min(u128::from(INFINITE - 1)) as u32;
        self.wait_ms(millis)
    }

    fn signal(&self, count: u32) {
        if count == 0 {
            return;
        }
        let count = count.min(i32::MAX as u32) as i32;
        // SAFETY: the handle is alive.
        if unsafe { ReleaseSemaphore(self.handle, count, ptr::null_mut()) } == 0 {
            fatal("ReleaseSemaphore", errno())
        }
    }
}

impl fmt::Debug for Win32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Win32").field("handle", &self.handle).finish()
    }
}

impl Drop for Win32 {
    fn drop(&mut self) {
        // SAFETY: we own the handle exclusively.
        unsafe { CloseHandle(self.handle) };
    }
}
