/// Buddy Allocator
///
/// Manages a single power-of-two arena. Free blocks are kept in one list per
/// tier, where tier `t` holds blocks of `min_block << t` bytes. Allocation
/// splits larger blocks down to the requested tier, freeing merges a block
/// with its buddy as long as both halves are free.

use rustc_hash::FxHashMap;

use super::error::{invalid_free_error, not_power_of_two_error, out_of_memory_error};
use super::{is_power_of_two, Allocator, ArenaId, Block};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};

/// Default minimum block size
pub const MIN_BLOCK_SIZE: u64 = 256;

pub struct BuddyAllocator {
    arena: ArenaId,
    size: u64,
    min_block: u64,
    /// Highest tier, holding the whole arena
    top: usize,
    /// Free block offsets per tier
    free: Vec<Vec<u64>>,
    /// Live allocations: offset -> size
    allocated: FxHashMap<u64, u64>,
}

impl BuddyAllocator {
    pub fn new(size: u64) -> CacheResult<Self> {
        Self::with_min_block(size, MIN_BLOCK_SIZE)
    }

    pub fn with_min_block(size: u64, min_block: u64) -> CacheResult<Self> {
        if !is_power_of_two(size) {
            return Err(not_power_of_two_error(size));
        }
        if !is_power_of_two(min_block) {
            return Err(not_power_of_two_error(min_block));
        }
        if min_block > size {
            return Err(CacheError::InvalidSize {
                size,
                reason: format!("arena is smaller than the minimum block of {} bytes", min_block),
            });
        }

        let top = tier_for(size, min_block);
        let mut free = vec![Vec::new(); top + 1];
        free[top].push(0);

        Ok(Self {
            arena: ArenaId::next(),
            size,
            min_block,
            top,
            free,
            allocated: FxHashMap::default(),
        })
    }

    pub fn with_config(size: u64, config: &CacheConfig) -> CacheResult<Self> {
        Self::with_min_block(size, config.min_block_size)
    }

    pub fn min_block(&self) -> u64 {
        self.min_block
    }

    /// Tier that serves requests of `size` bytes
    pub fn tier_of(&self, size: u64) -> usize {
        tier_for(size, self.min_block)
    }

    pub fn tier_size(&self, tier: usize) -> u64 {
        self.min_block << tier
    }

    /// Free block offsets currently held at `tier`
    pub fn free_blocks(&self, tier: usize) -> &[u64] {
        self.free.get(tier).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Release the block starting at `offset`.
    ///
    /// The size is looked up from the allocation record, so only offsets
    /// returned by `alloc` are accepted. An unknown offset leaves the free
    /// lists untouched.
    pub fn free_offset(&mut self, offset: u64) -> CacheResult<()> {
        let size = self
            .allocated
            .remove(&offset)
            .ok_or_else(|| invalid_free_error(offset))?;

        let tier = self.tier_of(size);
        self.free[tier].push(offset);
        self.merge(tier, offset);
        Ok(())
    }

    fn take_block(&mut self, tier: usize) -> Option<u64> {
        if tier > self.top {
            return None;
        }
        if let Some(offset) = self.free[tier].pop() {
            return Some(offset);
        }

        // split a block from the tier above, keeping the lower half
        let parent = self.take_block(tier + 1)?;
        let half = self.tier_size(tier);
        self.free[tier].push(parent + half);
        Some(parent)
    }

    fn merge(&mut self, mut tier: usize, mut offset: u64) {
        while tier < self.top {
            let size = self.tier_size(tier);
            // even blocks find their buddy after them, odd blocks before
            let buddy = offset ^ size;

            if self.allocated.contains_key(&buddy) {
                return;
            }
            let Some(buddy_idx) = self.free[tier].iter().position(|&o| o == buddy) else {
                return;
            };
            self.free[tier].swap_remove(buddy_idx);
            if let Some(own_idx) = self.free[tier].iter().position(|&o| o == offset) {
                self.free[tier].swap_remove(own_idx);
            }

            offset = offset.min(buddy);
            tier += 1;
            self.free[tier].push(offset);
        }
    }
}

impl Allocator for BuddyAllocator {
    fn alloc(&mut self, size: u64) -> CacheResult<Block> {
        if size == 0 {
            return Err(CacheError::InvalidSize {
                size,
                reason: "cannot allocate an empty block".to_string(),
            });
        }

        let tier = self.tier_of(size);
        let offset = self
            .take_block(tier)
            .ok_or_else(|| out_of_memory_error(size, self.free_space()))?;

        let block_size = self.tier_size(tier);
        self.allocated.insert(offset, block_size);
        Ok(Block::new(self.arena, offset, block_size))
    }

    fn free(&mut self, block: Block) -> CacheResult<()> {
        if block.arena() != self.arena {
            return Err(invalid_free_error(block.offset));
        }
        self.free_offset(block.offset)
    }

    fn free_space(&self) -> u64 {
        self.free
            .iter()
            .enumerate()
            .map(|(tier, blocks)| blocks.len() as u64 * self.tier_size(tier))
            .sum()
    }

    fn capacity(&self) -> u64 {
        self.size
    }
}

/// Requests too large to round up land one tier above 2^63, past any arena
fn tier_for(size: u64, min_block: u64) -> usize {
    let bits = size
        .max(min_block)
        .checked_next_power_of_two()
        .map_or(u64::BITS, u64::trailing_zeros);
    (bits - min_block.trailing_zeros()) as usize
}
