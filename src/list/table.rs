use core::{
    fmt,
    marker::PhantomData,
    mem::MaybeUninit,
    num::NonZeroU32,
    ptr,
    sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering::*},
};

const BUCKETS: usize = u32::BITS as usize;

/// Never wraps in practice, so a table id is unique for the whole process.
static TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// The location of a slot: bucket `b` holds `2^b` nodes, so the tables grow
/// by doubling without ever moving a node.
#[derive(Debug, Clone, Copy)]
struct BucketIndex {
    bucket: usize,
    bucket_count: usize,
    index: usize,
}

impl BucketIndex {
    fn from_slot(slot: NonZeroU32) -> Self {
        let bucket = u32::BITS - slot.leading_zeros() - 1;
        let bucket_count = 1 << bucket;
        let index = slot.get() - bucket_count;

        BucketIndex {
            bucket: bucket as usize,
            bucket_count: bucket_count as usize,
            index: index as usize,
        }
    }
}

/// The handle of a node in a [`NodeTable`].
///
/// Handles are only created by [`NodeTable::insert`] and remember their
/// table, so a handle can never address another table's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    slot: NonZeroU32,
    table: u64,
}

impl NodeId {
    /// The insertion index of the node in its table.
    pub fn index(&self) -> usize {
        self.slot.get() as usize - 1
    }

    pub(super) fn slot(&self) -> u32 {
        self.slot.get()
    }

    pub(super) fn from_slot(slot: u32, table: u64) -> Option<Self> {
        NonZeroU32::new(slot).map(|slot| NodeId { slot, table })
    }
}

pub(super) struct Node<T> {
    pub(super) next: AtomicU32,
    pub(super) value: T,
}

/// An append-only table of list nodes.
///
/// Insertion is lock-free and nodes never move nor get freed before the
/// table itself, which is what makes the tagged [`List`](super::List) safe
/// to traverse without hazard pointers.
pub struct NodeTable<T> {
    id: u64,
    len: AtomicU32,
    buckets: [AtomicPtr<Node<T>>; BUCKETS],
    marker: PhantomData<Node<T>>,
}

// SAFETY: values are moved in by `insert` and shared out by `get`.
unsafe impl<T: Send> Send for NodeTable<T> {}
unsafe impl<T: Send + Sync> Sync for NodeTable<T> {}

impl<T> NodeTable<T> {
    /// Creates an empty table with a fresh id.
    pub fn new() -> Self {
        let id = TABLE_ID.fetch_add(1, Relaxed);
        NodeTable {
            id,
            len: AtomicU32::new(0),
            buckets: [const { AtomicPtr::new(ptr::null_mut()) }; BUCKETS],
            marker: PhantomData,
        }
    }

    pub(super) fn id(&self) -> u64 {
        self.id
    }

    /// The number of nodes inserted so far.
    pub fn len(&self) -> usize {
        self.len.load(Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket(&self, bi: BucketIndex) -> *mut Node<T> {
        let slot = &self.buckets[bi.bucket];
        let bucket = slot.load(Acquire);
        if !bucket.is_null() {
            return bucket;
        }

        let new = Box::<[Node<T>]>::new_uninit_slice(bi.bucket_count);
        let new = Box::into_raw(new).cast::<Node<T>>();
        match slot.compare_exchange(ptr::null_mut(), new, AcqRel, Acquire) {
            Ok(_) => new,
            Err(existing) => {
                // SAFETY: `new` was allocated above as a boxed slice of
                // `bucket_count` uninitialized nodes and never shared.
                drop(unsafe { Self::bucket_box(new, bi.bucket_count) });
                existing
            }
        }
    }

    unsafe fn bucket_box(bucket: *mut Node<T>, count: usize) -> Box<[MaybeUninit<Node<T>>]> {
        let slice = ptr::slice_from_raw_parts_mut(bucket.cast::<MaybeUninit<Node<T>>>(), count);
        // SAFETY: see the callers.
        unsafe { Box::from_raw(slice) }
    }

    /// Inserts a value, returning the handle of its new node.
    ///
    /// # Panics
    ///
    /// Panics if the table already holds `u32::MAX` nodes.
    pub fn insert(&self, value: T) -> NodeId {
        let len = self
            .len
            .fetch_update(Relaxed, Relaxed, |len| len.checked_add(1))
            .expect("node table exhausted");
        let Some(id) = NodeId::from_slot(len + 1, self.id) else {
            unreachable!()
        };

        let bi = BucketIndex::from_slot(id.slot);
        let bucket = self.bucket(bi);
        // SAFETY: the slot is reserved by this thread only, and lies within
        // its bucket.
        unsafe {
            bucket.add(bi.index).write(Node {
                next: AtomicU32::new(0),
                value,
            })
        };
        id
    }

    pub(super) fn node(&self, id: NodeId) -> &Node<T> {
        assert_eq!(id.table, self.id, "the node belongs to another table");
        let bi = BucketIndex::from_slot(id.slot);
        let bucket = self.buckets[bi.bucket].load(Acquire);
        debug_assert!(!bucket.is_null());
        // SAFETY: `id` was returned by `insert` of this table, so the node is
        // initialized. Whoever handed the ID over synchronized with its
        // insertion.
        unsafe { &*bucket.add(bi.index) }
    }

    /// Gets the value of a node.
    ///
    /// # Panics
    ///
    /// Panics if `id` was returned by another table.
    pub fn get(&self, id: NodeId) -> &T {
        &self.node(id).value
    }

    /// Iterates over all the nodes in insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (NodeId, &mut T)> + '_ {
        let buckets: [*mut Node<T>; BUCKETS] =
            core::array::from_fn(|bucket| *self.buckets[bucket].get_mut());
        let (len, table) = (*self.len.get_mut(), self.id);
        (1..=len).filter_map(move |slot| {
            let id = NodeId::from_slot(slot, table)?;
            let bi = BucketIndex::from_slot(id.slot);
            // SAFETY: every slot up to `len` is initialized, and each one is
            // yielded once under the exclusive borrow of the table.
            let node = unsafe { &mut *buckets[bi.bucket].add(bi.index) };
            Some((id, &mut node.value))
        })
    }
}

impl<T> Default for NodeTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for NodeTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTable")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for NodeTable<T> {
    fn drop(&mut self) {
        self.iter_mut().for_each(|(_, value)| {
            // SAFETY: the values are dropped exactly once, right before their
            // buckets are freed below.
            unsafe { ptr::drop_in_place(value) }
        });
        for (index, bucket) in self.buckets.iter_mut().enumerate() {
            let bucket = *bucket.get_mut();
            if !bucket.is_null() {
                // SAFETY: the bucket was allocated in `bucket` with exactly
                // `2^index` nodes, and its contents are dropped above.
                drop(unsafe { Self::bucket_box(bucket, 1 << index) });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use core::sync::atomic::Ordering::*;
    use std::{num::NonZeroU32, sync::Arc, thread};

    use super::{BucketIndex, NodeTable, TABLE_ID};

    #[test]
    fn bucket_index() {
        let bi = |slot| {
            let bi = BucketIndex::from_slot(NonZeroU32::new(slot).unwrap());
            (bi.bucket, bi.bucket_count, bi.index)
        };
        assert_eq!(bi(1), (0, 1, 0));
        assert_eq!(bi(2), (1, 2, 0));
        assert_eq!(bi(3), (1, 2, 1));
        assert_eq!(bi(4), (2, 4, 0));
        assert_eq!(bi(u32::MAX), (31, 1 << 31, (1 << 31) - 1));
    }

    #[test]
    fn insert_get() {
        let table = NodeTable::new();
        let ids: Vec<_> = (0..1000).map(|i| table.insert(i.to_string())).collect();
        assert_eq!(table.len(), 1000);
        for (i, id) in ids.into_iter().enumerate() {
            assert_eq!(id.index(), i);
            assert_eq!(*table.get(id), i.to_string());
        }
    }

    #[test]
    fn concurrent_insert() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 500;
        let table = NodeTable::new();
        thread::scope(|s| {
            for tid in 0..THREADS {
                let table = &table;
                s.spawn(move || {
                    for i in 0..PER_THREAD {
                        let value = tid * PER_THREAD + i;
                        let id = table.insert(Arc::new(value));
                        assert_eq!(*table.get(id).as_ref(), value);
                    }
                });
            }
        });

        let mut table = table;
        let mut values: Vec<_> = table.iter_mut().map(|(_, value)| **value).collect();
        values.sort_unstable();
        assert!(values.into_iter().eq(0..THREADS * PER_THREAD));
    }

    #[test]
    fn drops_values() {
        let value = Arc::new(());
        {
            let table = NodeTable::new();
            for _ in 0..100 {
                table.insert(value.clone());
            }
            assert_eq!(Arc::strong_count(&value), 101);
        }
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[test]
    #[should_panic = "another table"]
    fn foreign_id() {
        let (a, b) = (NodeTable::new(), NodeTable::<u8>::new());
        let id = a.insert(0u8);
        b.get(id);
    }

    #[test]
    fn ids_past_u32() {
        TABLE_ID.fetch_max(u64::from(u32::MAX) - 1, Relaxed);
        let tables: Vec<_> = (0..3).map(|_| NodeTable::new()).collect();
        for (i, table) in tables.iter().enumerate() {
            let id = table.insert(i);
            assert_eq!(*table.get(id), i);
        }
        assert!(tables[2].id() > u64::from(u32::MAX));
    }
}
