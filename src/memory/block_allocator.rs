/// Free-List Block Allocator
///
/// Sub-allocates an existing power-of-two buffer. Requests are rounded up to
/// a power of two (at least 64 bytes) and served best-fit from a flat free
/// list; oversized blocks are halved until they match. Freed blocks are
/// merged with equal-sized contiguous neighbours after sorting by offset.
///
/// Simpler than the buddy allocator but O(n) per operation, which is fine for
/// the shared vertex/index pools where allocations are few and large.

use rustc_hash::FxHashMap;

use super::error::{invalid_free_error, not_power_of_two_error, out_of_memory_error};
use super::{is_power_of_two, next_power_of_two, Allocator, ArenaId, Block};
use crate::error::CacheResult;

/// Smallest block handed out
pub const MIN_ALLOCATION: u64 = 64;

pub struct BlockAllocator {
    arena: ArenaId,
    size: u64,
    free_list: Vec<Block>,
    /// Live allocations: offset -> size
    allocated: FxHashMap<u64, u64>,
}

impl BlockAllocator {
    pub fn new(size: u64) -> CacheResult<Self> {
        if !is_power_of_two(size) {
            return Err(not_power_of_two_error(size));
        }
        let arena = ArenaId::next();
        let mut free_list = Vec::with_capacity(128);
        free_list.push(Block::new(arena, 0, size));

        Ok(Self {
            arena,
            size,
            free_list,
            allocated: FxHashMap::default(),
        })
    }

    /// Identity of the buffer this allocator carves up
    pub fn arena(&self) -> ArenaId {
        self.arena
    }

    /// Current free blocks, in no particular order between frees
    pub fn free_list(&self) -> &[Block] {
        &self.free_list
    }

    pub fn live_allocations(&self) -> usize {
        self.allocated.len()
    }

    fn defragment(&mut self) {
        self.free_list.sort_by_key(|block| block.offset);

        loop {
            let mut merged = false;
            for i in 0..self.free_list.len().saturating_sub(1) {
                let (left, right) = (self.free_list[i], self.free_list[i + 1]);
                // only equal size blocks can be merged
                if left.size == right.size && left.end() == right.offset {
                    self.free_list[i].size += right.size;
                    self.free_list.remove(i + 1);
                    merged = true;
                    break;
                }
            }
            if !merged {
                break;
            }
        }
    }
}

impl Allocator for BlockAllocator {
    fn alloc(&mut self, size: u64) -> CacheResult<Block> {
        let size = next_power_of_two(size, MIN_ALLOCATION)
            .filter(|rounded| *rounded <= self.size)
            .ok_or_else(|| out_of_memory_error(size, self.free_space()))?;

        // smallest block that fits
        let smallest = self
            .free_list
            .iter()
            .enumerate()
            .filter(|(_, block)| block.size >= size)
            .min_by_key(|(_, block)| block.size)
            .map(|(idx, _)| idx)
            .ok_or_else(|| out_of_memory_error(size, self.free_space()))?;

        let mut block = self.free_list.remove(smallest);

        // split until the block matches the request
        while block.size >= size * 2 {
            block.size /= 2;
            self.free_list
                .push(Block::new(self.arena, block.offset + block.size, block.size));
        }

        self.allocated.insert(block.offset, block.size);
        Ok(block)
    }

    fn free(&mut self, block: Block) -> CacheResult<()> {
        if block.arena() != self.arena {
            return Err(invalid_free_error(block.offset));
        }
        match self.allocated.get(&block.offset) {
            Some(&size) if size == block.size => {}
            _ => return Err(invalid_free_error(block.offset)),
        }
        self.allocated.remove(&block.offset);

        self.free_list.push(block);
        self.defragment();
        Ok(())
    }

    fn free_space(&self) -> u64 {
        self.free_list.iter().map(|block| block.size).sum()
    }

    fn capacity(&self) -> u64 {
        self.size
    }
}
