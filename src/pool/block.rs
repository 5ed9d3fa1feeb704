use core::{
    alloc::Layout,
    cell::UnsafeCell,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering::*},
};

use crate::base::{BaseAlloc, Chunk};

/// The smallest piece a block can usefully serve; a block with less room
/// left than this is exhausted.
pub(super) const MIN_ALLOC: usize = 2 * size_of::<usize>();

/// A chunk of memory handed out by bumping an atomic offset.
///
/// A block stored in a node of the pool's table is either unused, holding no
/// chunk, or owns one chunk until the pool is cleared.
pub(super) struct Block<B: BaseAlloc> {
    base: AtomicPtr<u8>,
    capacity: AtomicUsize,
    offset: AtomicUsize,
    chunk: UnsafeCell<Option<Chunk<B>>>,
}

// SAFETY: `chunk` is only accessed by the thread owning the block exclusively:
// the one that set it up before publishing, or the one clearing the pool.
unsafe impl<B: BaseAlloc> Sync for Block<B> where Chunk<B>: Send {}

impl<B: BaseAlloc> Block<B> {
    pub(super) fn new(chunk: Chunk<B>, offset: usize) -> Self {
        let block = Block {
            base: AtomicPtr::new(ptr::null_mut()),
            capacity: AtomicUsize::new(0),
            offset: AtomicUsize::new(0),
            chunk: UnsafeCell::new(None),
        };
        // SAFETY: the block is not shared yet.
        unsafe { block.init(chunk, offset) };
        block
    }

    /// Sets up a fresh chunk, with its first `offset` bytes already taken.
    ///
    /// # Safety
    ///
    /// The block must be unused and owned exclusively by the current thread
    /// until it is published with release ordering.
    pub(super) unsafe fn init(&self, chunk: Chunk<B>, offset: usize) {
        let ptr = chunk.pointer();
        self.base.store(ptr.cast::<u8>().as_ptr(), Relaxed);
        self.capacity.store(ptr.len(), Relaxed);
        self.offset.store(offset, Relaxed);
        // SAFETY: see the function contract.
        unsafe { *self.chunk.get() = Some(chunk) };
    }

    /// Frees the chunk, returning the number of bytes it held.
    ///
    /// # Safety
    ///
    /// The block must be owned exclusively by the current thread, and no
    /// memory handed out from it may be used any longer.
    pub(super) unsafe fn release(&self) -> usize {
        let capacity = self.capacity.swap(0, Relaxed);
        self.base.store(ptr::null_mut(), Relaxed);
        self.offset.store(0, Relaxed);
        // SAFETY: see the function contract.
        drop(unsafe { (*self.chunk.get()).take() });
        capacity
    }

    pub(super) fn capacity(&self) -> usize {
        self.capacity.load(Relaxed)
    }

    pub(super) fn is_exhausted(&self) -> bool {
        let capacity = self.capacity.load(Relaxed);
        self.offset.load(Relaxed) + MIN_ALLOC > capacity
    }

    /// The start offset of `layout` placed at `offset` in a chunk at `base`,
    /// and the end offset of it.
    fn place(base: usize, offset: usize, layout: Layout) -> Option<(usize, usize)> {
        let addr = base.checked_add(offset)?;
        let start = addr.checked_next_multiple_of(layout.align())? - base;
        let end = start.checked_add(layout.size().max(1))?;
        Some((start, end))
    }

    /// Carves `layout` out of the block, failing if it doesn't fit in the
    /// remaining room.
    pub(super) fn bump(&self, layout: Layout) -> Option<NonNull<[u8]>> {
        let base = self.base.load(Relaxed);
        let capacity = self.capacity.load(Relaxed);
        if base.is_null() {
            return None;
        }

        let mut offset = self.offset.load(Relaxed);
        loop {
            let (start, end) = Self::place(base.addr(), offset, layout)?;
            if end > capacity {
                return None;
            }
            match self
                .offset
                .compare_exchange_weak(offset, end, Relaxed, Relaxed)
            {
                Ok(_) => {
                    // SAFETY: `start..end` is within the chunk.
                    let ptr = unsafe { NonNull::new_unchecked(base.add(start)) };
                    return Some(NonNull::slice_from_raw_parts(ptr, layout.size()));
                }
                Err(e) => offset = e,
            }
        }
    }

    /// Places `layout` at the start of a chunk of `capacity` bytes at `base`,
    /// returning the start and end offsets if it fits.
    pub(super) fn first_fit(
        base: NonNull<u8>,
        capacity: usize,
        layout: Layout,
    ) -> Option<(usize, usize)> {
        let (start, end) = Self::place(base.addr().get(), 0, layout)?;
        (end <= capacity).then_some((start, end))
    }
}
