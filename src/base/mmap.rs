use core::{alloc::Layout, mem::ManuallyDrop, ptr::NonNull};
use std::io;

use memmap2::{MmapMut, MmapOptions};

use super::{BaseAlloc, Chunk};

/// The base allocator backed by anonymous memory mappings.
///
/// Chunks are page-aligned; larger alignments are served by over-mapping and
/// rounding the start up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Mmap;

impl Mmap {
    pub const fn new() -> Self {
        Mmap
    }
}

fn map(len: usize) -> io::Result<MmapMut> {
    MmapOptions::new().len(len).map_anon()
}

// SAFETY: every chunk lies within a fresh, private & writable mapping which
// lives as long as the chunk.
unsafe impl BaseAlloc for Mmap {
    type Error = io::Error;
    type Handle = ManuallyDrop<MmapMut>;

    fn allocate(&self, layout: Layout) -> Result<Chunk<Self>, Self::Error> {
        fn round_up(addr: usize, layout: Layout) -> usize {
            (addr + layout.align() - 1) & !(layout.align() - 1)
        }

        if layout.size() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map zero bytes",
            ));
        }

        let mut trial = map(layout.size())?;
        if trial.as_ptr().addr() % layout.align() == 0 {
            let ptr = NonNull::new(trial.as_mut_ptr()).ok_or(io::ErrorKind::OutOfMemory)?;
            // SAFETY: `Chunk` is allocated from self.
            return Ok(unsafe { Chunk::new(ptr, layout, ManuallyDrop::new(trial)) });
        }

        drop(trial);
        let len = layout
            .size()
            .checked_add(layout.align())
            .ok_or(io::ErrorKind::OutOfMemory)?;
        let mut mapping = map(len)?;
        let ptr = mapping
            .as_mut_ptr()
            .map_addr(|addr| round_up(addr, layout));
        let ptr = NonNull::new(ptr).ok_or(io::ErrorKind::OutOfMemory)?;

        // SAFETY: `Chunk` is allocated from self, and the rounded pointer
        // leaves `layout.size()` bytes in the mapping.
        Ok(unsafe { Chunk::new(ptr, layout, ManuallyDrop::new(mapping)) })
    }

    unsafe fn deallocate(chunk: &mut Chunk<Self>) {
        // SAFETY: the chunk is dying, so the mapping is no longer used.
        unsafe { ManuallyDrop::drop(&mut chunk.handle) }
    }
}
