//! The module of base allocators.
//!
//! See [`BaseAlloc`] for more information.

#[cfg(feature = "base-mmap")]
mod mmap;

use core::{alloc::Layout, fmt, ptr::NonNull};
use std::alloc;

#[cfg(feature = "base-mmap")]
pub use self::mmap::Mmap;

/// The trait of base allocators.
///
/// A [`MemoryPool`](crate::MemoryPool) carves its allocations out of large
/// chunks, and only talks to its base allocator when it needs a whole new
/// chunk (or a dedicated one for an oversized request).
///
/// The implementations in this crate are [`Global`], backed by the Rust
/// global allocator, and [`Mmap`] backed by anonymous memory mappings.
///
/// # Safety
///
/// `allocate` must return a valid & free memory block containing `layout`, if
/// possible.
pub unsafe trait BaseAlloc: Sized {
    /// The opaque handle of this allocator, usually its metadata or for RAII
    /// purposes.
    type Handle;
    /// The errors of the base allocator.
    type Error: fmt::Debug + fmt::Display;

    /// Allocate a memory [`Chunk`] of `layout`.
    fn allocate(&self, layout: Layout) -> Result<Chunk<Self>, Self::Error>;

    /// Deallocate a memory [`Chunk`].
    ///
    /// Note that this function doesn't contain a receiver argument, since its
    /// additional information should be contained in the
    /// [`handle`](Chunk::handle) of the chunk.
    ///
    /// # Safety
    ///
    /// - `chunk` must point to a valid & owned memory block containing
    ///   `layout`, previously allocated by this allocator.
    /// - `chunk` must not be used any longer after the deallocation.
    unsafe fn deallocate(chunk: &mut Chunk<Self>);
}

/// The error of [`Global`]: the global allocator returned null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocError(pub Layout);

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory allocation of {} bytes (align {}) failed",
            self.0.size(),
            self.0.align()
        )
    }
}

impl std::error::Error for AllocError {}

/// The base allocator backed by the Rust global allocator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Global;

// SAFETY: the chunks come straight from `std::alloc::alloc`.
unsafe impl BaseAlloc for Global {
    type Handle = ();
    type Error = AllocError;

    fn allocate(&self, layout: Layout) -> Result<Chunk<Self>, AllocError> {
        if layout.size() == 0 {
            return Err(AllocError(layout));
        }
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).ok_or(AllocError(layout))?;
        // SAFETY: `ptr` is allocated from the global allocator with `layout`.
        Ok(unsafe { Chunk::new(ptr, layout, ()) })
    }

    unsafe fn deallocate(chunk: &mut Chunk<Self>) {
        // SAFETY: see the contract of `Chunk::new`.
        unsafe { alloc::dealloc(chunk.ptr.as_ptr(), chunk.layout) }
    }
}

/// An owned representation of a valid memory block. Implementations like
/// `Clone` and `Copy` are banned for its unique ownership.
pub struct Chunk<B: BaseAlloc> {
    ptr: NonNull<u8>,
    layout: Layout,
    pub handle: B::Handle,
}

// SAFETY: the chunk owns its memory; only the handle may carry thread
// affinity.
unsafe impl<B: BaseAlloc> Send for Chunk<B> where B::Handle: Send {}
unsafe impl<B: BaseAlloc> Sync for Chunk<B> where B::Handle: Sync {}

impl<B: BaseAlloc> Chunk<B> {
    /// Creates a memory chunk manually. This function should only be used by an
    /// implementation of a base allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must points to a valid & owned block of memory of `layout`, and
    /// must be allocated from the base allocator `B`.
    pub unsafe fn new(ptr: NonNull<u8>, layout: Layout, handle: B::Handle) -> Self {
        Chunk { ptr, layout, handle }
    }

    /// Retrieves the layout information of this chunk.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Retrieves the pointer of this chunk.
    pub fn pointer(&self) -> NonNull<[u8]> {
        NonNull::slice_from_raw_parts(self.ptr, self.layout.size())
    }
}

impl<B: BaseAlloc> fmt::Debug for Chunk<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("ptr", &self.ptr)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl<B: BaseAlloc> Drop for Chunk<B> {
    fn drop(&mut self) {
        // SAFETY: `chunk` points to a valid & owned memory block containing `layout`,
        // previously allocated by this allocator.
        unsafe { B::deallocate(self) }
    }
}
