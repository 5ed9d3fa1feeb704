//! The module of concurrent vectors.
//!
//! See [`ConcurrentVec`] for more information.

mod snapshot;

use core::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;

pub use self::snapshot::{Iter, Snapshot};

/// An append-only vector readable while being written.
///
/// The values live in a [`Snapshot`] held by an atomically swapped [`Arc`].
/// Readers grab the current snapshot and keep it alive for as long as they
/// iterate, so growing the vector never invalidates an iterator: a grower
/// seals the full snapshot, waits for its pending appends and publishes a
/// bigger copy, while old readers keep walking the old one.
///
/// Any number of threads may [`push`](Self::push) concurrently; values are
/// published in index order, so a reader never observes a hole.
///
/// [`clear`](Self::clear) and [`swap`](Self::swap) replace the snapshot
/// wholesale: a push racing with them may land in the replaced snapshot and
/// be lost.
///
/// The element type is restricted to `Copy` since growing copies the values
/// bitwise and iterators yield them by value.
///
/// # Examples
///
/// ```rust
/// use basis_sync::ConcurrentVec;
///
/// let vec = ConcurrentVec::new();
/// vec.push(1);
/// let iter = vec.iter();
/// vec.push(2);
///
/// assert_eq!(iter.collect::<Vec<_>>(), [1]);
/// assert_eq!(vec.to_vec(), [1, 2]);
/// ```
pub struct ConcurrentVec<T: Copy> {
    inner: ArcSwap<Snapshot<T>>,
}

impl<T: Copy> ConcurrentVec<T> {
    /// Creates an empty vector without allocating room for values.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty vector with room for `capacity` values.
    pub fn with_capacity(capacity: usize) -> Self {
        ConcurrentVec {
            inner: ArcSwap::from_pointee(Snapshot::with_capacity(capacity)),
        }
    }

    /// Retrieves the current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot<T>> {
        self.inner.load_full()
    }

    /// Appends a value to the back of the vector.
    pub fn push(&self, value: T) {
        let mut value = value;
        loop {
            let current = self.inner.load_full();
            match current.try_push(value) {
                Ok(()) => break,
                Err(v) => value = v,
            }
            let needed = current.capacity() + 1;
            self.grow(&current, needed);
        }
    }

    /// Replaces `current` with a copy of at least `needed` capacity, unless
    /// another thread replaced it first.
    #[cold]
    fn grow(&self, current: &Arc<Snapshot<T>>, needed: usize) {
        let len = current.seal();
        let capacity = needed.max(len * 2);
        let new = Arc::new(current.copy(len, capacity));
        // Losing the race is fine: the caller retries on the winner's copy.
        let _ = self.inner.compare_and_swap(current, new);
    }

    /// Makes room for at least `capacity` values in total.
    pub fn reserve(&self, capacity: usize) {
        loop {
            let current = self.inner.load_full();
            if current.capacity() >= capacity {
                break;
            }
            let len = current.seal();
            let new = Arc::new(current.copy(len, capacity.max(len)));
            let prev = self.inner.compare_and_swap(&current, new);
            if Arc::ptr_eq(&*prev, &current) {
                break;
            }
        }
    }

    /// Removes all the values, keeping no capacity.
    ///
    /// Live iterators keep yielding the old values.
    pub fn clear(&self) {
        self.inner.store(Arc::new(Snapshot::with_capacity(0)));
    }

    /// Exchanges the contents of two vectors.
    ///
    /// Each vector is replaced atomically, but not both at once.
    pub fn swap(&self, other: &Self) {
        let mine = self.inner.load_full();
        let theirs = other.inner.swap(mine);
        self.inner.store(theirs);
    }

    /// The number of values published so far.
    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.load().capacity()
    }

    /// Copies out the value at `index`, if it has been published.
    pub fn get(&self, index: usize) -> Option<T> {
        self.inner.load().get(index)
    }

    /// Iterates over the values present at the time of the call.
    pub fn iter(&self) -> Iter<T> {
        self.snapshot().iter()
    }

    /// Copies the current values into a fresh [`Vec`].
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }
}

impl<T: Copy> Default for ConcurrentVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> Clone for ConcurrentVec<T> {
    fn clone(&self) -> Self {
        self.iter().collect()
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for ConcurrentVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner.load(), f)
    }
}

impl<T: Copy> FromIterator<T> for ConcurrentVec<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let values = iter.into_iter().collect();
        ConcurrentVec {
            inner: ArcSwap::from_pointee(Snapshot::from_vec(values)),
        }
    }
}

impl<T: Copy> Extend<T> for ConcurrentVec<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        iter.into_iter().for_each(|value| self.push(value))
    }
}

impl<'a, T: Copy> IntoIterator for &'a ConcurrentVec<T> {
    type Item = T;
    type IntoIter = Iter<T>;

    fn into_iter(self) -> Iter<T> {
        self.iter()
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicBool, Ordering::*},
        thread,
    };

    use super::ConcurrentVec;

    #[test]
    fn basic() {
        let vec = ConcurrentVec::with_capacity(2);
        assert!(vec.is_empty());
        for i in 0..100u32 {
            vec.push(i);
        }
        assert_eq!(vec.len(), 100);
        assert!(vec.capacity() >= 100);
        assert_eq!(vec.get(42), Some(42));
        assert_eq!(vec.get(100), None);
        assert_eq!((&vec).into_iter().sum::<u32>(), 4950);

        let old = vec.iter();
        vec.clear();
        assert!(vec.is_empty());
        assert_eq!(old.len(), 100);

        vec.reserve(10);
        assert!(vec.capacity() >= 10);
        vec.push(7);
        assert_eq!(vec.to_vec(), [7]);
    }

    #[test]
    fn swap_and_clone() {
        let a: ConcurrentVec<_> = (0..5).collect();
        let b = ConcurrentVec::new();
        b.push(-1);

        a.swap(&b);
        assert_eq!(a.to_vec(), [-1]);
        assert_eq!(b.to_vec(), [0, 1, 2, 3, 4]);

        let c = b.clone();
        b.push(5);
        assert_eq!(c.len(), 5);
        assert_eq!(format!("{c:?}"), "[0, 1, 2, 3, 4]");
    }

    #[test]
    fn single_writer() {
        const COUNT: u64 = 10_000;
        const READERS: usize = 4;

        let vec = ConcurrentVec::<(u64, u64)>::new();
        let done = AtomicBool::new(false);
        thread::scope(|s| {
            for _ in 0..READERS {
                s.spawn(|| {
                    while !done.load(Acquire) {
                        let len = vec.len();
                        let iter = vec.iter();
                        assert!(iter.len() >= len);
                        for (index, (value, check)) in iter.enumerate() {
                            assert_eq!(value, index as u64);
                            assert_eq!(check, !value);
                        }
                    }
                });
            }
            for i in 0..COUNT {
                vec.push((i, !i));
            }
            done.store(true, Release);
        });
        assert_eq!(vec.len(), COUNT as usize);
    }

    #[test]
    fn multiple_writers() {
        const WRITERS: usize = 4;
        const PER_WRITER: usize = 5000;

        let vec = ConcurrentVec::new();
        let done = AtomicBool::new(false);
        thread::scope(|s| {
            let reader = s.spawn(|| {
                while !done.load(Acquire) {
                    let snapshot = vec.snapshot();
                    assert!(snapshot.len() <= snapshot.capacity());
                    assert!(snapshot.iter().all(|value: usize| value < WRITERS * PER_WRITER));
                }
            });
            let writers: Vec<_> = (0..WRITERS)
                .map(|w| {
                    let vec = &vec;
                    s.spawn(move || {
                        for i in 0..PER_WRITER {
                            vec.push(w * PER_WRITER + i);
                        }
                    })
                })
                .collect();
            writers.into_iter().for_each(|w| w.join().unwrap());
            done.store(true, Release);
            reader.join().unwrap();
        });

        let mut values = vec.to_vec();
        values.sort_unstable();
        assert!(values.into_iter().eq(0..WRITERS * PER_WRITER));
    }
}
