/// Device Memory Sub-Allocation
///
/// Carves large device allocations into blocks so that meshes and other
/// buffer-backed resources share a few big buffers instead of owning one
/// device allocation each.
///
/// Two strategies are provided:
/// - `BuddyAllocator`: fixed power-of-two arena, O(log n) split/merge by tier
/// - `BlockAllocator`: free-list over a power-of-two buffer, best-fit with
///   offset-sorted defragmentation

pub mod block_allocator;
pub mod buddy_allocator;
pub mod error;

pub use block_allocator::BlockAllocator;
pub use buddy_allocator::BuddyAllocator;
pub use error::{invalid_free_error, out_of_memory_error};

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::CacheResult;

/// Capability token naming the arena a block was carved from.
///
/// Blocks never own their allocator; the allocator only compares tokens to
/// reject frees of foreign blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaId(u64);

impl ArenaId {
    pub(crate) fn next() -> Self {
        static NEXT_ARENA: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ARENA.fetch_add(1, Ordering::Relaxed))
    }
}

/// A live sub-allocation. Valid until passed back to `free` on the allocator
/// that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub offset: u64,
    pub size: u64,
    arena: ArenaId,
}

impl Block {
    pub(crate) fn new(arena: ArenaId, offset: u64, size: u64) -> Self {
        Self { offset, size, arena }
    }

    pub fn arena(&self) -> ArenaId {
        self.arena
    }

    /// One past the last byte of the block
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Common interface of the sub-allocators
pub trait Allocator: Send {
    /// Allocate a block of at least `size` bytes
    fn alloc(&mut self, size: u64) -> CacheResult<Block>;

    /// Return a block to the allocator
    fn free(&mut self, block: Block) -> CacheResult<()>;

    /// Bytes currently available across all free blocks
    fn free_space(&self) -> u64;

    /// Total size of the managed range
    fn capacity(&self) -> u64;

    fn used_space(&self) -> u64 {
        self.capacity() - self.free_space()
    }
}

pub fn is_power_of_two(n: u64) -> bool {
    n > 0 && (n & (n - 1)) == 0
}

/// Smallest power of two >= `n`, never below `floor`. `None` when it does
/// not fit in a `u64`.
pub fn next_power_of_two(n: u64, floor: u64) -> Option<u64> {
    n.max(floor).checked_next_power_of_two()
}
