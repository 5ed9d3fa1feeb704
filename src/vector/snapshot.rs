use core::{
    cell::UnsafeCell,
    fmt,
    iter::FusedIterator,
    mem::MaybeUninit,
    sync::atomic::{AtomicUsize, Ordering::*},
};
use std::sync::Arc;

use crossbeam_utils::Backoff;

/// Set on the reservation cursor once the snapshot is being replaced.
const SEALED: usize = 1 << (usize::BITS - 1);

/// One generation of the storage of a [`ConcurrentVec`](super::ConcurrentVec).
///
/// The first [`len`](Self::len) values of a snapshot never change; writers
/// only append past them, and a full snapshot is replaced by a bigger copy
/// instead of growing in place.
pub struct Snapshot<T> {
    size: AtomicUsize,
    next: AtomicUsize,
    values: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: every slot is written once, by the writer that reserved it, before
// it is published through `size`.
unsafe impl<T: Send + Sync> Sync for Snapshot<T> {}

impl<T: Copy> Snapshot<T> {
    pub(super) fn with_capacity(capacity: usize) -> Self {
        assert!(capacity < SEALED, "capacity overflow");
        Snapshot {
            size: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            values: (0..capacity)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
        }
    }

    pub(super) fn from_vec(values: Vec<T>) -> Self {
        let len = values.len();
        let values: Box<[_]> = values
            .into_iter()
            .map(|value| UnsafeCell::new(MaybeUninit::new(value)))
            .collect();
        Snapshot {
            size: AtomicUsize::new(len),
            next: AtomicUsize::new(len),
            values,
        }
    }

    /// Copies the first `len` values into a new snapshot of `capacity`.
    pub(super) fn copy(&self, len: usize, capacity: usize) -> Self {
        debug_assert!(len <= self.len() && len <= capacity);
        let new = Self::with_capacity(capacity);
        for index in 0..len {
            // SAFETY: `index` is published and no longer written.
            let value = unsafe { self.read(index) };
            // SAFETY: `new` is not shared yet.
            unsafe { (*new.values[index].get()).write(value) };
        }
        new.size.store(len, Relaxed);
        new.next.store(len, Relaxed);
        new
    }

    /// # Safety
    ///
    /// `index` must be published, i.e. less than an acquired `size`.
    unsafe fn read(&self, index: usize) -> T {
        // SAFETY: see the function contract.
        unsafe { (*self.values[index].get()).assume_init_read() }
    }

    /// The number of published values.
    pub fn len(&self) -> usize {
        self.size.load(Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, index: usize) -> Option<T> {
        // SAFETY: `index` is published.
        (index < self.len()).then(|| unsafe { self.read(index) })
    }

    /// Appends a value if there is room and the snapshot is not sealed,
    /// handing the value back otherwise.
    ///
    /// Values are published in index order: a writer waits for the writers
    /// of the lower indices before bumping `size`, so a reader never sees an
    /// unwritten slot below `size`.
    pub(super) fn try_push(&self, value: T) -> Result<(), T> {
        let capacity = self.capacity();
        let mut next = self.next.load(Relaxed);
        let index = loop {
            if next & SEALED != 0 || next >= capacity {
                return Err(value);
            }
            match self
                .next
                .compare_exchange_weak(next, next + 1, Relaxed, Relaxed)
            {
                Ok(_) => break next,
                Err(e) => next = e,
            }
        };

        // SAFETY: the slot is reserved by this thread only.
        unsafe { (*self.values[index].get()).write(value) };

        let backoff = Backoff::new();
        while self.size.load(Acquire) != index {
            backoff.snooze();
        }
        self.size.store(index + 1, Release);
        Ok(())
    }

    /// Stops further appends and waits for the pending ones to be published,
    /// returning the final length.
    pub(super) fn seal(&self) -> usize {
        let reserved = self.next.fetch_or(SEALED, AcqRel) & !SEALED;

        let backoff = Backoff::new();
        while self.size.load(Acquire) != reserved {
            backoff.snooze();
        }
        reserved
    }

    /// Iterates over the values published so far.
    pub fn iter(self: &Arc<Self>) -> Iter<T> {
        Iter {
            end: self.len(),
            snapshot: self.clone(),
            index: 0,
        }
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.len();
        // SAFETY: all the indices below `len` are published.
        f.debug_list()
            .entries((0..len).map(|index| unsafe { self.read(index) }))
            .finish()
    }
}

/// An iterator over a [`Snapshot`], keeping it alive.
///
/// Values appended after the iterator is created are not yielded.
pub struct Iter<T> {
    snapshot: Arc<Snapshot<T>>,
    index: usize,
    end: usize,
}

impl<T> Clone for Iter<T> {
    fn clone(&self) -> Self {
        Iter {
            snapshot: self.snapshot.clone(),
            index: self.index,
            end: self.end,
        }
    }
}

impl<T: Copy> Iterator for Iter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.index >= self.end {
            return None;
        }
        // SAFETY: `end` was an acquired `size` of the snapshot.
        let value = unsafe { self.snapshot.read(self.index) };
        self.index += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.end - self.index;
        (len, Some(len))
    }

    fn nth(&mut self, n: usize) -> Option<T> {
        self.index = self.index.saturating_add(n).min(self.end);
        self.next()
    }
}

impl<T: Copy> ExactSizeIterator for Iter<T> {}

impl<T: Copy> FusedIterator for Iter<T> {}

impl<T> fmt::Debug for Iter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("index", &self.index)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread};

    use super::Snapshot;

    #[test]
    fn seal_stops_appends() {
        let snapshot = Snapshot::with_capacity(4);
        snapshot.try_push(1).unwrap();
        snapshot.try_push(2).unwrap();
        assert_eq!(snapshot.seal(), 2);
        assert_eq!(snapshot.try_push(3), Err(3));
        assert_eq!(snapshot.len(), 2);

        let copy = snapshot.copy(2, 8);
        assert_eq!((copy.len(), copy.capacity()), (2, 8));
        assert_eq!(copy.get(1), Some(2));
        assert_eq!(copy.get(2), None);
    }

    #[test]
    fn full() {
        let snapshot = Snapshot::with_capacity(2);
        snapshot.try_push(1u8).unwrap();
        snapshot.try_push(2).unwrap();
        assert_eq!(snapshot.try_push(3), Err(3));
        assert_eq!(snapshot.seal(), 2);
    }

    #[test]
    fn ordered_publication() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1000;
        let snapshot = Arc::new(Snapshot::with_capacity(THREADS * PER_THREAD));

        thread::scope(|s| {
            for tid in 0..THREADS {
                let snapshot = &snapshot;
                s.spawn(move || {
                    for i in 0..PER_THREAD {
                        snapshot.try_push((tid * PER_THREAD + i) as u64 + 1).unwrap();
                    }
                });
            }
            s.spawn(|| {
                while snapshot.len() < THREADS * PER_THREAD {
                    assert!(snapshot.iter().all(|value| value != 0));
                }
            });
        });

        let mut values: Vec<_> = snapshot.iter().collect();
        values.sort_unstable();
        assert!(values.into_iter().eq(1..=(THREADS * PER_THREAD) as u64));
    }
}
