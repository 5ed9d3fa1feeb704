//! The module of concurrent memory pools.
//!
//! See [`MemoryPool`] for more information.

mod block;

use core::{
    alloc::{Layout, LayoutError},
    fmt,
    mem::MaybeUninit,
    ptr::{self, NonNull},
    slice,
    sync::atomic::{AtomicUsize, Ordering::*},
};

use self::block::Block;
use crate::{
    Stat,
    base::{BaseAlloc, Chunk, Global},
    config::CHUNK_SHIFT,
    list::{List, NodeId, NodeTable},
};

/// The default size of the chunks of a pool.
pub const CHUNK_SIZE: usize = 1 << CHUNK_SHIFT;
const CHUNK_ALIGN: usize = 16;

#[derive(Debug, Default)]
struct Counters {
    blocks: AtomicUsize,
    big_blocks: AtomicUsize,
    basic_bytes: AtomicUsize,
    big_bytes: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> Stat {
        Stat {
            blocks: self.blocks.load(Relaxed),
            big_blocks: self.big_blocks.load(Relaxed),
            basic_bytes: self.basic_bytes.load(Relaxed),
            big_bytes: self.big_bytes.load(Relaxed),
        }
    }

    fn add(&self, big: bool, bytes: usize) {
        let (count, total) = if big {
            (&self.big_blocks, &self.big_bytes)
        } else {
            (&self.blocks, &self.basic_bytes)
        };
        count.fetch_add(1, Relaxed);
        total.fetch_add(bytes, Relaxed);
    }

    fn sub(&self, stat: &Stat) {
        self.blocks.fetch_sub(stat.blocks, Relaxed);
        self.big_blocks.fetch_sub(stat.big_blocks, Relaxed);
        self.basic_bytes.fetch_sub(stat.basic_bytes, Relaxed);
        self.big_bytes.fetch_sub(stat.big_bytes, Relaxed);
    }
}

/// A lock-free bump allocator serving many threads from shared chunks.
///
/// The pool requests chunks of a fixed size from its base allocator and hands
/// out pieces of them by bumping an atomic offset. Pieces are never freed one
/// by one: the memory is reclaimed all at once by [`clear`](Self::clear) or
/// when the pool drops.
///
/// Blocks circulate among lock-free [`List`]s:
///
/// - `live`: blocks with room left, the front one serving most requests;
/// - `full`: exhausted blocks;
/// - `big`: blocks dedicated to a single request larger than a chunk;
/// - `spare`: unused table nodes, recycled after a clear.
///
/// # Examples
///
/// ```rust
/// use basis_sync::{MemoryPool, base::Global};
///
/// let pool = MemoryPool::with_chunk_size(Global, 4096);
/// let x = pool.alloc(1u32).unwrap();
/// let y = pool.alloc(2u32).unwrap();
/// *x += *y;
/// assert_eq!(*x, 3);
///
/// let stat = unsafe { pool.clear() };
/// assert_eq!(stat.basic_bytes, 4096);
/// ```
pub struct MemoryPool<B: BaseAlloc = Global> {
    base: B,
    chunk_size: usize,
    blocks: NodeTable<Block<B>>,
    live: List<Block<B>>,
    full: List<Block<B>>,
    big: List<Block<B>>,
    spare: List<Block<B>>,
    counters: Counters,
}

impl<B: BaseAlloc> MemoryPool<B> {
    /// Creates a pool with chunks of [`CHUNK_SIZE`] bytes.
    pub fn new(base: B) -> Self {
        Self::with_chunk_size(base, CHUNK_SIZE)
    }

    /// Creates a pool with chunks of `chunk_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is too small to hold a single piece.
    pub fn with_chunk_size(base: B, chunk_size: usize) -> Self {
        assert!(
            chunk_size >= 2 * block::MIN_ALLOC,
            "chunk size {chunk_size} is too small"
        );
        let blocks = NodeTable::new();
        MemoryPool {
            base,
            chunk_size,
            live: List::new(&blocks),
            full: List::new(&blocks),
            big: List::new(&blocks),
            spare: List::new(&blocks),
            blocks,
            counters: Counters::default(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Retrieves the base allocator of this pool.
    pub fn base(&self) -> &B {
        &self.base
    }

    /// Whether `layout` fits in a fresh chunk wherever the chunk lands.
    fn fits_in_chunk(&self, layout: Layout) -> bool {
        let slack = layout.align().saturating_sub(CHUNK_ALIGN);
        layout
            .size()
            .checked_add(slack)
            .is_some_and(|needed| needed <= self.chunk_size)
    }

    /// Allocates a piece of memory of `layout`.
    ///
    /// The memory lives until the pool is cleared or dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the base allocator fails to provide a new chunk.
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, Error<B>> {
        if layout.size() == 0 {
            let dangling = NonNull::new(ptr::without_provenance_mut(layout.align()));
            return Ok(NonNull::slice_from_raw_parts(
                dangling.unwrap_or(NonNull::dangling()),
                0,
            ));
        }
        if !self.fits_in_chunk(layout) {
            return self.allocate_big(layout);
        }

        // A stale front just fails to bump.
        if let Some(id) = self.live.front()
            && let Some(ptr) = self.blocks.get(id).bump(layout)
        {
            return Ok(ptr);
        }

        // Blocks too short for this request but still good for smaller ones
        // stay off `live` until the search ends, or popping would find them
        // again forever.
        let mut skipped = Vec::new();
        let found = loop {
            let Some(id) = self.live.try_pop(&self.blocks) else {
                break None;
            };
            let block = self.blocks.get(id);
            match block.bump(layout) {
                Some(ptr) => break Some((id, ptr)),
                None if block.is_exhausted() => self.full.push(&self.blocks, id),
                None => skipped.push(id),
            }
        };
        for id in skipped.into_iter().rev() {
            self.live.push(&self.blocks, id);
        }

        match found {
            Some((id, ptr)) => {
                self.retire(id, self.blocks.get(id));
                Ok(ptr)
            }
            None => self.allocate_fresh(layout),
        }
    }

    /// Puts a block popped off `live` back to where it belongs.
    fn retire(&self, id: NodeId, block: &Block<B>) {
        if block.is_exhausted() {
            self.full.push(&self.blocks, id);
        } else {
            self.live.push(&self.blocks, id);
        }
    }

    /// Stores a fresh chunk into a recycled or a new node.
    fn install(&self, chunk: Chunk<B>, offset: usize) -> NodeId {
        match self.spare.try_pop(&self.blocks) {
            Some(id) => {
                // SAFETY: spare blocks are unused, and the popping thread owns
                // them until they're pushed to another list.
                unsafe { self.blocks.get(id).init(chunk, offset) };
                id
            }
            None => self.blocks.insert(Block::new(chunk, offset)),
        }
    }

    #[cold]
    fn allocate_fresh(&self, layout: Layout) -> Result<NonNull<[u8]>, Error<B>> {
        let chunk_layout =
            Layout::from_size_align(self.chunk_size, CHUNK_ALIGN).map_err(Error::Layout)?;
        let chunk = self.base.allocate(chunk_layout).map_err(Error::Alloc)?;
        let base = chunk.pointer().cast::<u8>();
        let Some((start, end)) = Block::<B>::first_fit(base, self.chunk_size, layout) else {
            unreachable!("{layout:?} should fit in a fresh chunk")
        };
        // SAFETY: `start..end` is within the chunk.
        let ptr = unsafe { base.add(start) };

        self.counters.add(false, self.chunk_size);
        let id = self.install(chunk, end);
        report!(
            trace,
            "memory pool: new block #{} ({} bytes)",
            id.index(),
            self.chunk_size
        );
        self.retire(id, self.blocks.get(id));

        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    #[cold]
    fn allocate_big(&self, layout: Layout) -> Result<NonNull<[u8]>, Error<B>> {
        let layout = layout.align_to(CHUNK_ALIGN).map_err(Error::Layout)?;
        let chunk = self.base.allocate(layout).map_err(Error::Alloc)?;
        let ptr = chunk.pointer();

        self.counters.add(true, layout.size());
        let id = self.install(chunk, layout.size());
        report!(
            trace,
            "memory pool: new big block #{} ({} bytes)",
            id.index(),
            layout.size()
        );
        self.big.push(&self.blocks, id);
        Ok(ptr)
    }

    /// Allocates an uninitialized array of `n` elements of `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the array layout overflows or the base allocator
    /// fails.
    #[allow(clippy::mut_from_ref)]
    pub fn get<T>(&self, n: usize) -> Result<&mut [MaybeUninit<T>], Error<B>> {
        let layout = Layout::array::<T>(n).map_err(Error::Layout)?;
        let ptr = self.allocate(layout)?.cast::<MaybeUninit<T>>();
        // SAFETY: the memory is valid for `n` elements of `T`, uniquely handed
        // out, and lives until the pool is cleared.
        Ok(unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), n) })
    }

    /// Moves `value` into the pool.
    ///
    /// Note that the value will never be dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the base allocator fails.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc<T>(&self, value: T) -> Result<&mut T, Error<B>> {
        let slot = &mut self.get::<T>(1)?[0];
        Ok(slot.write(value))
    }

    /// A racy snapshot of the blocks held by the pool.
    pub fn stat(&self) -> Stat {
        self.counters.snapshot()
    }

    /// Frees every block of the pool, returning the totals released.
    ///
    /// The table nodes of the blocks are kept for reuse.
    ///
    /// # Safety
    ///
    /// - No other thread may use the pool during the clearance.
    /// - No memory previously allocated from the pool may be used any longer.
    pub unsafe fn clear(&self) -> Stat {
        let mut stat = Stat::INIT;

        let basic = self.live.steal(&self.blocks).chain(self.full.steal(&self.blocks));
        for id in basic {
            // SAFETY: the block is detached and, per the function contract,
            // unused.
            stat.basic_bytes += unsafe { self.blocks.get(id).release() };
            stat.blocks += 1;
            self.spare.push(&self.blocks, id);
        }
        for id in self.big.steal(&self.blocks) {
            // SAFETY: the same as above.
            stat.big_bytes += unsafe { self.blocks.get(id).release() };
            stat.big_blocks += 1;
            self.spare.push(&self.blocks, id);
        }

        self.counters.sub(&stat);
        report!(debug, "memory pool: cleared {stat:?}");
        stat
    }
}

impl<B: BaseAlloc + Default> Default for MemoryPool<B> {
    fn default() -> Self {
        Self::new(B::default())
    }
}

impl<B: BaseAlloc> fmt::Debug for MemoryPool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("chunk_size", &self.chunk_size)
            .field("stat", &self.stat())
            .finish_non_exhaustive()
    }
}

impl<B: BaseAlloc> Drop for MemoryPool<B> {
    fn drop(&mut self) {
        let capacity = |(_, block): (NodeId, &mut Block<B>)| block.capacity();
        let held: usize = self.blocks.iter_mut().map(capacity).sum();
        if held > 0 {
            report!(debug, "memory pool: dropping {held} bytes");
        }
        // The chunks are freed with the node table.
    }
}

/// The errors of a [`MemoryPool`].
pub enum Error<B: BaseAlloc> {
    /// The base allocator failed to provide a chunk.
    Alloc(B::Error),
    /// The requested layout is invalid.
    Layout(LayoutError),
}

impl<B: BaseAlloc> fmt::Debug for Error<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alloc(err) => f.debug_tuple("Alloc").field(err).finish(),
            Self::Layout(err) => f.debug_tuple("Layout").field(err).finish(),
        }
    }
}

impl<B: BaseAlloc> fmt::Display for Error<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Alloc(err) => write!(f, "base allocation failed: {err}"),
            Error::Layout(err) => write!(f, "invalid allocation layout: {err}"),
        }
    }
}

impl<B: BaseAlloc> std::error::Error for Error<B> {}
