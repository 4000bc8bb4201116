use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache exhausted: requested {requested} positions, {available} available")]
    CacheExhausted { requested: usize, available: usize },

    #[error("invalid cache position {position} for layer {layer}: expected {expected}")]
    CachePositionInvalid {
        layer: usize,
        position: usize,
        expected: usize,
    },

    #[error("cache handle {handle} is not allocated")]
    HandleNotAllocated { handle: u64 },

    #[error("layer {layer} out of range: cache has {num_layers} layers")]
    LayerOutOfRange { layer: usize, num_layers: usize },

    #[error("block {block_id} is not allocated")]
    BlockNotAllocated { block_id: usize },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_cache_exhausted() {
        let e = CacheError::CacheExhausted {
            requested: 12,
            available: 4,
        };
        assert_eq!(
            e.to_string(),
            "cache exhausted: requested 12 positions, 4 available"
        );
    }

    #[test]
    fn display_position_invalid() {
        let e = CacheError::CachePositionInvalid {
            layer: 0,
            position: 11,
            expected: 10,
        };
        assert_eq!(
            e.to_string(),
            "invalid cache position 11 for layer 0: expected 10"
        );
    }

    #[test]
    fn display_handle_not_allocated() {
        let e = CacheError::HandleNotAllocated { handle: 7 };
        assert_eq!(e.to_string(), "cache handle 7 is not allocated");
    }
}
