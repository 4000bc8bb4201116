use super::block_pool::BlockId;

/// Per-sequence mapping from logical token positions to physical cache slots.
#[derive(Debug, Clone)]
pub struct BlockTable {
    blocks: Vec<BlockId>,
    num_tokens: usize,
    block_size: usize,
}

impl BlockTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            num_tokens: 0,
            block_size,
        }
    }

    /// Tokens currently accounted for in this table.
    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn block_ids(&self) -> &[BlockId] {
        &self.blocks
    }

    /// New blocks required before `additional` more tokens can be stored.
    pub fn blocks_needed(&self, additional: usize) -> usize {
        if additional == 0 {
            return 0;
        }
        let total = self.num_tokens + additional;
        total.div_ceil(self.block_size).saturating_sub(self.blocks.len())
    }

    pub fn append_blocks(&mut self, ids: &[BlockId]) {
        self.blocks.extend_from_slice(ids);
    }

    /// Account for `n` tokens written to the cache.
    pub fn advance(&mut self, n: usize) {
        self.num_tokens += n;
    }

    /// Physical slot for each position in `[start, start + n)`.
    ///
    /// All positions must fall inside already-appended blocks.
    pub fn slot_mapping(&self, start: usize, n: usize) -> Vec<usize> {
        (start..start + n)
            .map(|pos| {
                let block = self.blocks[pos / self.block_size];
                block * self.block_size + pos % self.block_size
            })
            .collect()
    }

    /// Drop the mapping, handing back every block for freeing.
    pub fn release(&mut self) -> Vec<BlockId> {
        self.num_tokens = 0;
        std::mem::take(&mut self.blocks)
    }
}
