use std::collections::{HashSet, VecDeque};

use super::error::CacheError;

pub type BlockId = usize;

/// Allocator over the physical cache blocks of the paged backend. Pure
/// bookkeeping; the tensors live in [`super::paged::PagedKvCache`].
///
/// Blocks are handed out lowest-id first and recycled in the order they come
/// back.
pub struct BlockPool {
    free: VecDeque<BlockId>,
    in_use: HashSet<BlockId>,
    capacity: usize,
}

impl BlockPool {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            free: (0..num_blocks).collect(),
            in_use: HashSet::new(),
            capacity: num_blocks,
        }
    }

    /// Claim `n` blocks, or fail with `CacheExhausted` leaving the pool
    /// untouched.
    pub fn allocate(&mut self, n: usize) -> Result<Vec<BlockId>, CacheError> {
        if n > self.free.len() {
            return Err(CacheError::CacheExhausted {
                requested: n,
                available: self.free.len(),
            });
        }
        let ids: Vec<BlockId> = self.free.drain(..n).collect();
        self.in_use.extend(ids.iter().copied());
        Ok(ids)
    }

    /// Return blocks to the free list. Freeing a block the pool does not
    /// consider allocated is a bookkeeping bug and is reported, not ignored.
    pub fn free(&mut self, blocks: &[BlockId]) -> Result<(), CacheError> {
        for &id in blocks {
            if !self.in_use.remove(&id) {
                return Err(CacheError::BlockNotAllocated { block_id: id });
            }
            self.free.push_back(id);
        }
        Ok(())
    }

    /// Blocks not currently claimed by any sequence.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
