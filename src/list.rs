//! The module of lock-free LIFO lists.
//!
//! Nodes live in a [`NodeTable`] and are linked by their slot numbers, so a
//! list head fits in a single 64-bit word together with a generation tag:
//!
//! ```text
//! | generation: u32 | slot: u32 |
//! ```
//!
//! Slot `0` means empty. Every successful modification bumps the generation,
//! so a thread holding a stale head can never win a CAS against it (the ABA
//! problem). Nodes are never freed before their table, so reading the `next`
//! link of a node that was popped under our feet is harmless.

mod table;

use core::{
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering::*},
};

use crossbeam_utils::CachePadded;

pub use self::table::{NodeId, NodeTable};

const fn pack(slot: u32, generation: u32) -> u64 {
    ((generation as u64) << 32) | slot as u64
}

const fn unpack(head: u64) -> (u32, u32) {
    (head as u32, (head >> 32) as u32)
}

/// A lock-free stack of nodes in a [`NodeTable`].
///
/// A node must be on at most one list at a time; pushing a node that is
/// already linked corrupts both lists (but never memory).
///
/// # Examples
///
/// ```rust
/// use basis_sync::{List, NodeTable};
///
/// let table = NodeTable::new();
/// let list = List::new(&table);
///
/// let ids: Vec<_> = (1..=3).map(|i| table.insert(i)).collect();
/// ids.iter().for_each(|&id| list.push(&table, id));
///
/// let popped = list.try_pop(&table).unwrap();
/// assert_eq!(*table.get(popped), 3);
/// assert_eq!(list.steal(&table).map(|id| *table.get(id)).collect::<Vec<_>>(), [2, 1]);
/// assert!(list.is_empty());
/// ```
pub struct List<T> {
    head: CachePadded<AtomicU64>,
    table: u64,
    marker: PhantomData<fn(&NodeTable<T>)>,
}

impl<T> List<T> {
    /// Creates an empty list of nodes in `table`.
    pub fn new(table: &NodeTable<T>) -> Self {
        List {
            head: CachePadded::new(AtomicU64::new(0)),
            table: table.id(),
            marker: PhantomData,
        }
    }

    fn check(&self, table: &NodeTable<T>) {
        assert_eq!(table.id(), self.table, "the list belongs to another table");
    }

    /// Pushes a node to the front of the list.
    pub fn push(&self, table: &NodeTable<T>, id: NodeId) {
        self.check(table);
        let node = table.node(id);

        let mut old = self.head.load(Relaxed);
        loop {
            let (slot, generation) = unpack(old);
            node.next.store(slot, Relaxed);

            let new = pack(id.slot(), generation.wrapping_add(1));
            match self
                .head
                .compare_exchange_weak(old, new, Release, Relaxed)
            {
                Ok(_) => break,
                Err(e) => old = e,
            }
        }
    }

    /// Pops the front node of the list, if any.
    pub fn try_pop(&self, table: &NodeTable<T>) -> Option<NodeId> {
        self.check(table);

        let mut old = self.head.load(Acquire);
        loop {
            let (slot, generation) = unpack(old);
            let id = NodeId::from_slot(slot, self.table)?;
            let next = table.node(id).next.load(Relaxed);

            let new = pack(next, generation.wrapping_add(1));
            match self
                .head
                .compare_exchange_weak(old, new, Acquire, Acquire)
            {
                Ok(_) => break Some(id),
                Err(e) => old = e,
            }
        }
    }

    /// Detaches the whole chain of the list at once, leaving it empty.
    ///
    /// The returned iterator walks the former chain front to back.
    pub fn steal<'a>(&self, table: &'a NodeTable<T>) -> Chain<'a, T> {
        self.check(table);

        let mut old = self.head.load(Acquire);
        let slot = loop {
            let (slot, generation) = unpack(old);
            if slot == 0 {
                break 0;
            }
            let new = pack(0, generation.wrapping_add(1));
            match self
                .head
                .compare_exchange_weak(old, new, Acquire, Acquire)
            {
                Ok(_) => break slot,
                Err(e) => old = e,
            }
        };
        Chain { table, next: slot }
    }

    /// Peeks the front node of the list.
    ///
    /// The result is only a hint: the node may be popped by another thread
    /// at any moment. Still, whatever was written to the node before it got
    /// pushed is visible.
    pub fn front(&self) -> Option<NodeId> {
        let (slot, _) = unpack(self.head.load(Acquire));
        NodeId::from_slot(slot, self.table)
    }

    pub fn is_empty(&self) -> bool {
        self.front().is_none()
    }
}

impl<T> fmt::Debug for List<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (slot, generation) = unpack(self.head.load(Relaxed));
        f.debug_struct("List")
            .field("front", &slot)
            .field("generation", &generation)
            .finish()
    }
}

/// The chain detached by [`List::steal`].
#[derive(Debug)]
pub struct Chain<'a, T> {
    table: &'a NodeTable<T>,
    next: u32,
}

impl<T> Iterator for Chain<'_, T> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = NodeId::from_slot(self.next, self.table.id())?;
        // Read the link before yielding: the caller may push the node
        // somewhere else right away.
        self.next = self.table.node(id).next.load(Relaxed);
        Some(id)
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering::*},
        thread,
    };

    use super::{List, NodeTable, pack, unpack};

    #[test]
    fn tagging() {
        assert_eq!(unpack(pack(7, 3)), (7, 3));
        assert_eq!(unpack(pack(u32::MAX, u32::MAX)), (u32::MAX, u32::MAX));
    }

    #[test]
    fn lifo() {
        let table = NodeTable::new();
        let list = List::new(&table);
        let [n1, n2, n3] = [1, 2, 3].map(|i| table.insert(i));

        assert!(list.is_empty());
        list.push(&table, n1);
        list.push(&table, n2);
        list.push(&table, n3);
        assert_eq!(list.front(), Some(n3));

        assert_eq!(list.try_pop(&table), Some(n3));
        assert_eq!(list.try_pop(&table), Some(n2));
        assert_eq!(list.try_pop(&table), Some(n1));
        assert_eq!(list.try_pop(&table), None);
        assert_eq!(list.steal(&table).count(), 0);
    }

    #[test]
    fn generation_bumps() {
        let table = NodeTable::new();
        let list = List::new(&table);
        let id = table.insert(());

        list.push(&table, id);
        let before = list.head.load(Relaxed);
        list.try_pop(&table);
        list.push(&table, id);
        let after = list.head.load(Relaxed);

        // Same front node, different head word.
        assert_eq!(unpack(before).0, unpack(after).0);
        assert_ne!(before, after);
    }

    #[test]
    fn steal_and_reuse() {
        let table = NodeTable::new();
        let (a, b) = (List::new(&table), List::new(&table));
        for i in 0..10 {
            a.push(&table, table.insert(i));
        }

        // Moving nodes while iterating the stolen chain keeps the walk intact.
        let moved: Vec<_> = a
            .steal(&table)
            .inspect(|&id| b.push(&table, id))
            .map(|id| *table.get(id))
            .collect();
        assert_eq!(moved, (0..10).rev().collect::<Vec<_>>());
        assert!(a.is_empty());

        let back: Vec<_> = b.steal(&table).map(|id| *table.get(id)).collect();
        assert_eq!(back, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn contended() {
        const THREADS: usize = 8;
        const NODES: usize = 64;
        const ROUNDS: usize = 5000;

        let table = NodeTable::new();
        let list = List::new(&table);
        for i in 0..NODES {
            list.push(&table, table.insert(i));
        }

        let pops = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    let mut held = Vec::new();
                    for round in 0..ROUNDS {
                        if round % 3 != 2 {
                            if let Some(id) = list.try_pop(&table) {
                                pops.fetch_add(1, Relaxed);
                                held.push(id);
                            }
                        } else if let Some(id) = held.pop() {
                            list.push(&table, id);
                        }
                    }
                    held.into_iter().for_each(|id| list.push(&table, id));
                });
            }
        });

        assert!(pops.load(Relaxed) > 0);
        let values: HashSet<_> = list.steal(&table).map(|id| *table.get(id)).collect();
        assert_eq!(values, (0..NODES).collect());
    }

    #[test]
    #[should_panic = "another table"]
    fn foreign_table() {
        let (a, b) = (NodeTable::<u32>::new(), NodeTable::new());
        let list = List::new(&a);
        list.push(&b, b.insert(0));
    }
}
