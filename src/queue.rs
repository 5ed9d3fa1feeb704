//! The module of bounded MPMC queues.

use core::{
    cell::UnsafeCell,
    fmt,
    mem::MaybeUninit,
    sync::atomic::{AtomicUsize, Ordering::*},
};

use crossbeam_utils::CachePadded;

/// The error returned by [`BoundedQueue::push`] when the queue is full,
/// handing the rejected value back.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Full<T>(pub T);

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue is full")
    }
}

impl<T> std::error::Error for Full<T> {}

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn new(sequence: usize) -> Self {
        Slot {
            sequence: AtomicUsize::new(sequence),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// A bounded multi-producer multi-consumer queue of `N` slots.
///
/// Each slot carries a sequence number telling which lap of the ring it is
/// ready for:
///
/// - `sequence == pos`: empty, ready for the producer at `pos`;
/// - `sequence == pos + 1`: full, ready for the consumer at `pos`.
///
/// Producers and consumers claim positions with a CAS on the tail and head
/// cursors, so neither operation ever blocks. Values pushed by one producer
/// are popped in order; across producers the order is per slot.
///
/// # Examples
///
/// ```rust
/// use basis_sync::BoundedQueue;
///
/// let queue = BoundedQueue::<_, 4>::new();
/// for i in 0..4 {
///     queue.push(i).unwrap();
/// }
/// assert_eq!(queue.push(4).unwrap_err().0, 4);
/// assert_eq!(queue.pop(), Some(0));
/// ```
pub struct BoundedQueue<T, const N: usize> {
    slots: Box<[Slot<T>; N]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: values are moved in and out of the slots exactly once, guarded by
// the sequence numbers.
unsafe impl<T: Send, const N: usize> Send for BoundedQueue<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for BoundedQueue<T, N> {}

impl<T, const N: usize> BoundedQueue<T, N> {
    const MASK: usize = N - 1;

    /// Creates an empty queue.
    ///
    /// # Panics
    ///
    /// Panics if `N` is not a power of two or is less than 4.
    pub fn new() -> Self {
        assert!(
            N >= 4 && N.is_power_of_two(),
            "the capacity of a bounded queue must be a power of two no less than 4, got {N}"
        );
        let slots: Box<[Slot<T>]> = (0..N).map(Slot::new).collect();
        let Ok(slots) = slots.try_into() else {
            unreachable!("exactly {N} slots are collected")
        };
        BoundedQueue {
            slots,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Pushes a value to the back of the queue.
    ///
    /// # Errors
    ///
    /// Returns the value back if the queue is full.
    pub fn push(&self, value: T) -> Result<(), Full<T>> {
        let mut pos = self.tail.load(Relaxed);
        let slot = loop {
            let slot = &self.slots[pos & Self::MASK];
            let sequence = slot.sequence.load(Acquire);
            match (sequence as isize).wrapping_sub(pos as isize) {
                0 => match self
                    .tail
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Relaxed, Relaxed)
                {
                    Ok(_) => break slot,
                    Err(e) => pos = e,
                },
                // The slot still holds the value of the previous lap.
                diff if diff < 0 => return Err(Full(value)),
                _ => pos = self.tail.load(Relaxed),
            }
        };

        // SAFETY: the position is claimed by this thread and the slot is
        // empty for this lap.
        unsafe { (*slot.value.get()).write(value) };
        slot.sequence.store(pos.wrapping_add(1), Release);
        Ok(())
    }

    /// Pops the value at the front of the queue, if any.
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.head.load(Relaxed);
        let slot = loop {
            let slot = &self.slots[pos & Self::MASK];
            let sequence = slot.sequence.load(Acquire);
            match (sequence as isize).wrapping_sub(pos.wrapping_add(1) as isize) {
                0 => match self
                    .head
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Relaxed, Relaxed)
                {
                    Ok(_) => break slot,
                    Err(e) => pos = e,
                },
                diff if diff < 0 => return None,
                _ => pos = self.head.load(Relaxed),
            }
        };

        // SAFETY: the position is claimed by this thread and the slot was
        // filled for this lap.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.sequence.store(pos.wrapping_add(N), Release);
        Some(value)
    }

    /// The number of values in the queue, racy under contention.
    pub fn len(&self) -> usize {
        loop {
            let tail = self.tail.load(Acquire);
            let head = self.head.load(Acquire);
            if self.tail.load(Acquire) == tail {
                break tail.wrapping_sub(head).min(N);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Default for BoundedQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> fmt::Debug for BoundedQueue<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &N)
            .finish()
    }
}

impl<T, const N: usize> Drop for BoundedQueue<T, N> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::HashSet,
        sync::{Arc, atomic::{AtomicUsize, Ordering::*}},
        thread,
    };

    use super::BoundedQueue;

    #[test]
    fn capacity_four() {
        let queue = BoundedQueue::<u32, 4>::new();
        assert_eq!(queue.pop(), None);
        for i in 0..4 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.push(4).unwrap_err().0, 4);

        for i in 0..4 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn wraps_around() {
        let queue = BoundedQueue::<usize, 8>::new();
        for lap in 0..100 {
            for i in 0..5 {
                queue.push(lap * 5 + i).unwrap();
            }
            for i in 0..5 {
                assert_eq!(queue.pop(), Some(lap * 5 + i));
            }
        }
    }

    #[test]
    #[should_panic = "power of two"]
    fn bad_capacity() {
        BoundedQueue::<u8, 6>::new();
    }

    #[test]
    fn drops_remaining() {
        let value = Arc::new(());
        {
            let queue = BoundedQueue::<_, 16>::new();
            for _ in 0..10 {
                queue.push(value.clone()).unwrap();
            }
            queue.pop();
        }
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[test]
    fn spsc_order() {
        const COUNT: usize = 100_000;
        let queue = BoundedQueue::<usize, 64>::new();
        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..COUNT {
                    let mut value = i;
                    while let Err(full) = queue.push(value) {
                        value = full.0;
                        thread::yield_now();
                    }
                }
            });
            let mut expected = 0;
            while expected < COUNT {
                if let Some(value) = queue.pop() {
                    assert_eq!(value, expected);
                    expected += 1;
                }
            }
        });
    }

    #[test]
    fn mpmc() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;

        let queue = BoundedQueue::<usize, 128>::new();
        let consumed = AtomicUsize::new(0);
        let seen = thread::scope(|s| {
            for p in 0..PRODUCERS {
                let queue = &queue;
                s.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut value = p * PER_PRODUCER + i;
                        while let Err(full) = queue.push(value) {
                            value = full.0;
                            thread::yield_now();
                        }
                    }
                });
            }
            let consumers: Vec<_> = (0..CONSUMERS)
                .map(|_| {
                    s.spawn(|| {
                        let mut seen = Vec::new();
                        while consumed.load(Relaxed) < PRODUCERS * PER_PRODUCER {
                            match queue.pop() {
                                Some(value) => {
                                    seen.push(value);
                                    consumed.fetch_add(1, Relaxed);
                                }
                                None => thread::yield_now(),
                            }
                        }
                        seen
                    })
                })
                .collect();
            consumers
                .into_iter()
                .flat_map(|c| c.join().unwrap())
                .collect::<Vec<_>>()
        });

        assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);
        let unique: HashSet<_> = seen.into_iter().collect();
        assert_eq!(unique.len(), PRODUCERS * PER_PRODUCER);
    }

    #[test]
    fn large_capacity() {
        // Far bigger than a thread's stack.
        let queue = BoundedQueue::<[u64; 16], { 1 << 16 }>::new();
        assert_eq!(queue.capacity(), 1 << 16);
        for i in 0..100 {
            queue.push([i; 16]).unwrap();
        }
        assert_eq!(queue.pop(), Some([0; 16]));
        assert_eq!(queue.len(), 99);
    }
}
