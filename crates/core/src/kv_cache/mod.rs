//! KV cache storage for both decode backends.
//!
//! The contiguous [`pool::CachePool`] backs the vanilla backend; the paged
//! [`paged::PagedKvCache`] plus [`block_pool::BlockPool`] back the optimized
//! one. Models only ever see a [`KvSlot`], so the same forward pass runs
//! unchanged against either layout.

pub mod block_pool;
pub mod block_table;
pub mod config;
pub mod error;
pub mod paged;
pub mod pool;

pub use block_pool::{BlockId, BlockPool};
pub use block_table::BlockTable;
pub use config::CacheConfig;
pub use error::CacheError;
pub use paged::{PagedKvCache, PagedSlot};
pub use pool::{CacheHandle, CachePool, PooledSlot};

use candle_core::Tensor;

/// One sequence's view of its KV history, independent of cache layout.
///
/// `append` stores `[n, num_kv_heads, head_dim]` keys and values for the next
/// `n` positions of `layer`; `window` returns everything stored so far in
/// position order with the same shape. Within one forward pass every layer
/// must append the same number of positions, layer 0 first.
pub trait KvSlot {
    /// Positions stored so far (after layer 0's appends).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&mut self, layer: usize, keys: &Tensor, values: &Tensor) -> Result<(), CacheError>;

    fn window(&self, layer: usize) -> Result<(Tensor, Tensor), CacheError>;
}
