use super::error::CacheError;

/// Sizing for one KV cache pool.
///
/// `cache_size` is the total token budget shared by all sequences that are
/// concurrently active in the pool. Per-layer buffers for a sequence of
/// capacity `c` have shape `[c, num_kv_heads, head_dim]`.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_size: usize,
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.cache_size == 0 {
            return Err(CacheError::CacheExhausted {
                requested: 1,
                available: 0,
            });
        }
        if self.num_layers == 0 || self.num_kv_heads == 0 || self.head_dim == 0 {
            return Err(CacheError::LayerOutOfRange {
                layer: 0,
                num_layers: self.num_layers,
            });
        }
        Ok(())
    }

    /// Shape of one sequence's per-layer K (or V) buffer at `capacity` tokens.
    pub fn layer_shape(&self, capacity: usize) -> (usize, usize, usize) {
        (capacity, self.num_kv_heads, self.head_dim)
    }
}
