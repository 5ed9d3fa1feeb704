//! Lock-free memory & synchronization primitives.
//!
//! This crate is the concurrency toolkit of a larger support library. Its
//! pieces build on each other from the bottom up:
//!
//! - [`os`]: one blocking semaphore per target family behind
//!   [`PlatformSemaphore`](os::PlatformSemaphore);
//! - [`Semaphore`]: a counting semaphore that spins on an atomic counter
//!   before parking on the OS one;
//! - [`Event`] and [`AutoResetEvent`]: sticky and self-resetting
//!   notifications;
//! - [`SharedMutex`] and [`RwLock`]: a reader-writer lock whose whole state
//!   is one packed 64-bit atomic word;
//! - [`List`]: a lock-free LIFO free-list protected from ABA by generation
//!   tags;
//! - [`BoundedQueue`]: a bounded MPMC ring buffer;
//! - [`MemoryPool`]: a chunked, lock-free bump allocator built on [`List`];
//! - [`ConcurrentVec`]: a copy-on-grow vector whose iterators pin a snapshot;
//! - [`ThreadPool`]: worker threads draining immediate and delayed tasks.
//!
//! # Examples
//!
//! ```rust
//! use basis_sync::{MemoryPool, RwLock, base::Global};
//!
//! let pool = MemoryPool::new(Global);
//! let numbers = pool.get::<u64>(16).unwrap();
//! numbers[0].write(42);
//!
//! let lock = RwLock::new(0).unwrap();
//! *lock.write() += 1;
//! assert_eq!(*lock.read(), 1);
//! ```

macro_rules! report {
    ($level:ident, $($arg:tt)+) => {{
        #[cfg(feature = "error-log")]
        log::$level!($($arg)+);
        #[cfg(not(feature = "error-log"))]
        let _ = format_args!($($arg)+);
    }};
}

/// Build-time configurations.
///
/// Every constant can be overridden by setting the environment variable of
/// its name prefixed with `BS_` while building, e.g. `BS_SPIN_COUNT=100`.
pub mod config {
    include!(concat!(env!("OUT_DIR"), "/config.rs"));
}

pub mod base;
pub mod event;
pub mod list;
pub mod os;
pub mod pool;
pub mod queue;
pub mod rwlock;
pub mod sema;
mod stat;
pub mod thread_pool;
pub mod vector;

pub use self::{
    event::{AutoResetEvent, Event},
    list::{List, NodeId, NodeTable},
    pool::MemoryPool,
    queue::BoundedQueue,
    rwlock::{RwLock, SharedMutex},
    sema::Semaphore,
    stat::Stat,
    thread_pool::ThreadPool,
    vector::ConcurrentVec,
};
