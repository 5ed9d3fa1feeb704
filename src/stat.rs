/// Block and byte accounting of a [`MemoryPool`](crate::MemoryPool).
///
/// Returned by both [`MemoryPool::stat`](crate::MemoryPool::stat), as a racy
/// snapshot, and [`MemoryPool::clear`](crate::MemoryPool::clear), as the exact
/// totals of the memory released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stat {
    /// Chunk-sized blocks, live or full.
    pub blocks: usize,
    /// Blocks dedicated to one oversized allocation each.
    pub big_blocks: usize,

    /// Bytes held by chunk-sized blocks.
    pub basic_bytes: usize,
    /// Bytes held by big blocks.
    pub big_bytes: usize,
}

impl Default for Stat {
    fn default() -> Self {
        Self::INIT
    }
}

impl Stat {
    /// The empty statistics.
    pub const INIT: Stat = Stat {
        blocks: 0,
        big_blocks: 0,
        basic_bytes: 0,
        big_bytes: 0,
    };

    /// The sum of all bytes held by the pool.
    pub fn total_bytes(&self) -> usize {
        self.basic_bytes + self.big_bytes
    }

    /// Panics if any block is still counted, which means it was leaked.
    pub fn assert_clean(&self) {
        assert_eq!(self.blocks, 0, "{} block(s) is(are) probably leaked", self.blocks);
        assert_eq!(
            self.big_blocks, 0,
            "{} big block(s) is(are) probably leaked",
            self.big_blocks
        );
    }
}
