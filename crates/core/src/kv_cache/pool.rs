use std::collections::HashMap;
use std::ops::Range;

use candle_core::{DType, Device, Tensor};

use super::config::CacheConfig;
use super::error::CacheError;
use super::KvSlot;

/// Identifies one sequence's reserved region in a [`CachePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheHandle(u64);

impl CacheHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

struct SequenceBuffers {
    capacity: usize,
    /// Per-layer (K, V) buffers, shape `[capacity, num_kv_heads, head_dim]`.
    layers: Vec<(Tensor, Tensor)>,
    /// Next write position per layer. Writes must start exactly here.
    cursors: Vec<usize>,
}

/// Contiguous per-sequence KV storage with pooled capacity accounting.
///
/// Each `allocate` reserves zero-initialized per-layer K/V buffers against the
/// shared `cache_size` token budget. Writes are strictly in-order per layer;
/// `release` must be called exactly once per handle.
pub struct CachePool {
    config: CacheConfig,
    dtype: DType,
    device: Device,
    capacity_used: usize,
    next_handle: u64,
    entries: HashMap<u64, SequenceBuffers>,
}

impl CachePool {
    pub fn new(config: CacheConfig, dtype: DType, device: Device) -> Result<Self, CacheError> {
        config.validate()?;
        Ok(Self {
            config,
            dtype,
            device,
            capacity_used: 0,
            next_handle: 0,
            entries: HashMap::new(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Tokens of pool capacity not currently reserved.
    pub fn available(&self) -> usize {
        self.config.cache_size - self.capacity_used
    }

    /// Reserve zero-initialized buffers for one sequence of up to `capacity`
    /// tokens. Fails with `CacheExhausted` when the pool budget is spent.
    pub fn allocate(&mut self, capacity: usize) -> Result<CacheHandle, CacheError> {
        if capacity > self.available() {
            return Err(CacheError::CacheExhausted {
                requested: capacity,
                available: self.available(),
            });
        }
        let shape = self.config.layer_shape(capacity);
        let mut layers = Vec::with_capacity(self.config.num_layers);
        for _ in 0..self.config.num_layers {
            let k = Tensor::zeros(shape, self.dtype, &self.device)?;
            let v = Tensor::zeros(shape, self.dtype, &self.device)?;
            layers.push((k, v));
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.entries.insert(
            handle,
            SequenceBuffers {
                capacity,
                layers,
                cursors: vec![0; self.config.num_layers],
            },
        );
        self.capacity_used += capacity;
        Ok(CacheHandle(handle))
    }

    /// Store `keys`/`values` (`[n, num_kv_heads, head_dim]`) at `positions`.
    ///
    /// Positions must continue exactly where the layer's cursor stands;
    /// anything else is `CachePositionInvalid`. In-order writes that would
    /// run past the reserved capacity fail with `CacheExhausted`.
    pub fn write(
        &mut self,
        handle: CacheHandle,
        layer: usize,
        positions: Range<usize>,
        keys: &Tensor,
        values: &Tensor,
    ) -> Result<(), CacheError> {
        let num_layers = self.config.num_layers;
        let entry = self
            .entries
            .get_mut(&handle.0)
            .ok_or(CacheError::HandleNotAllocated { handle: handle.0 })?;
        if layer >= num_layers {
            return Err(CacheError::LayerOutOfRange { layer, num_layers });
        }
        let cursor = entry.cursors[layer];
        if positions.start != cursor || positions.end < positions.start {
            return Err(CacheError::CachePositionInvalid {
                layer,
                position: positions.start,
                expected: cursor,
            });
        }
        if positions.end > entry.capacity {
            return Err(CacheError::CacheExhausted {
                requested: positions.end,
                available: entry.capacity,
            });
        }
        let n = positions.end - positions.start;
        let (heads, dim) = (self.config.num_kv_heads, self.config.head_dim);
        let (k, v) = &mut entry.layers[layer];
        *k = k.slice_assign(&[positions.clone(), 0..heads, 0..dim], keys)?;
        *v = v.slice_assign(&[positions, 0..heads, 0..dim], values)?;
        entry.cursors[layer] = cursor + n;
        Ok(())
    }

    /// Read the causal window `[0, up_to)` for one layer.
    pub fn read(
        &self,
        handle: CacheHandle,
        layer: usize,
        up_to: usize,
    ) -> Result<(Tensor, Tensor), CacheError> {
        let entry = self
            .entries
            .get(&handle.0)
            .ok_or(CacheError::HandleNotAllocated { handle: handle.0 })?;
        if layer >= self.config.num_layers {
            return Err(CacheError::LayerOutOfRange {
                layer,
                num_layers: self.config.num_layers,
            });
        }
        let cursor = entry.cursors[layer];
        if up_to > cursor {
            return Err(CacheError::CachePositionInvalid {
                layer,
                position: up_to,
                expected: cursor,
            });
        }
        let (k, v) = &entry.layers[layer];
        Ok((k.narrow(0, 0, up_to)?, v.narrow(0, 0, up_to)?))
    }

    /// Next write position for a layer.
    pub fn position(&self, handle: CacheHandle, layer: usize) -> Result<usize, CacheError> {
        let entry = self
            .entries
            .get(&handle.0)
            .ok_or(CacheError::HandleNotAllocated { handle: handle.0 })?;
        entry
            .cursors
            .get(layer)
            .copied()
            .ok_or(CacheError::LayerOutOfRange {
                layer,
                num_layers: self.config.num_layers,
            })
    }

    /// Return a handle's capacity to the pool. Exactly once per handle;
    /// a second release reports `HandleNotAllocated`.
    pub fn release(&mut self, handle: CacheHandle) -> Result<(), CacheError> {
        let entry = self
            .entries
            .remove(&handle.0)
            .ok_or(CacheError::HandleNotAllocated { handle: handle.0 })?;
        self.capacity_used -= entry.capacity;
        Ok(())
    }
}

/// [`KvSlot`] view binding one handle to its pool for the duration of a
/// forward pass.
pub struct PooledSlot<'a> {
    pool: &'a mut CachePool,
    handle: CacheHandle,
}

impl<'a> PooledSlot<'a> {
    pub fn new(pool: &'a mut CachePool, handle: CacheHandle) -> Self {
        Self { pool, handle }
    }
}

impl KvSlot for PooledSlot<'_> {
    fn len(&self) -> usize {
        self.pool.position(self.handle, 0).unwrap_or(0)
    }

    fn append(&mut self, layer: usize, keys: &Tensor, values: &Tensor) -> Result<(), CacheError> {
        let start = self.pool.position(self.handle, layer)?;
        let n = keys.dim(0)?;
        self.pool
            .write(self.handle, layer, start..start + n, keys, values)
    }

    fn window(&self, layer: usize) -> Result<(Tensor, Tensor), CacheError> {
        let up_to = self.pool.position(self.handle, layer)?;
        self.pool.read(self.handle, layer, up_to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cache_size: usize) -> CachePool {
        let config = CacheConfig {
            cache_size,
            num_layers: 2,
            num_kv_heads: 1,
            head_dim: 4,
        };
        CachePool::new(config, DType::F32, Device::Cpu).unwrap()
    }

    fn rows(n: usize, base: f32) -> Tensor {
        let data: Vec<f32> = (0..n * 4).map(|i| base + i as f32).collect();
        Tensor::from_vec(data, (n, 1, 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn allocate_reduces_available() {
        let mut pool = pool(64);
        let _h = pool.allocate(24).unwrap();
        assert_eq!(pool.available(), 40);
    }

    #[test]
    fn allocate_over_budget_is_exhausted() {
        let mut pool = pool(16);
        let _h = pool.allocate(10).unwrap();
        match pool.allocate(7) {
            Err(CacheError::CacheExhausted {
                requested,
                available,
            }) => {
                assert_eq!(requested, 7);
                assert_eq!(available, 6);
            }
            other => panic!("expected CacheExhausted, got {other:?}"),
        }
    }

    #[test]
    fn write_read_roundtrip() {
        let mut pool = pool(32);
        let h = pool.allocate(8).unwrap();
        let k = rows(3, 1.0);
        let v = rows(3, 100.0);
        pool.write(h, 0, 0..3, &k, &v).unwrap();

        let (rk, rv) = pool.read(h, 0, 3).unwrap();
        assert_eq!(rk.to_vec3::<f32>().unwrap(), k.to_vec3::<f32>().unwrap());
        assert_eq!(rv.to_vec3::<f32>().unwrap(), v.to_vec3::<f32>().unwrap());
    }

    #[test]
    fn out_of_order_write_is_position_invalid() {
        let mut pool = pool(32);
        let h = pool.allocate(10).unwrap();
        pool.write(h, 0, 0..2, &rows(2, 0.0), &rows(2, 0.0)).unwrap();
        // Cursor is at 2; skipping ahead is out of order.
        match pool.write(h, 0, 5..6, &rows(1, 0.0), &rows(1, 0.0)) {
            Err(CacheError::CachePositionInvalid {
                position, expected, ..
            }) => {
                assert_eq!(position, 5);
                assert_eq!(expected, 2);
            }
            other => panic!("expected CachePositionInvalid, got {other:?}"),
        }
    }

    #[test]
    fn write_past_cache_size_is_position_invalid() {
        // cache_size = 10, one sequence owning the whole pool.
        let mut pool = pool(10);
        let h = pool.allocate(10).unwrap();
        let r = pool.write(h, 0, 11..12, &rows(1, 0.0), &rows(1, 0.0));
        assert!(matches!(r, Err(CacheError::CachePositionInvalid { .. })));
    }

    #[test]
    fn in_order_overflow_is_exhausted() {
        let mut pool = pool(10);
        let h = pool.allocate(10).unwrap();
        pool.write(h, 0, 0..10, &rows(10, 0.0), &rows(10, 0.0))
            .unwrap();
        let r = pool.write(h, 0, 10..11, &rows(1, 0.0), &rows(1, 0.0));
        assert!(matches!(r, Err(CacheError::CacheExhausted { .. })));
    }

    #[test]
    fn cursors_are_independent_per_layer() {
        let mut pool = pool(32);
        let h = pool.allocate(8).unwrap();
        pool.write(h, 0, 0..4, &rows(4, 0.0), &rows(4, 0.0)).unwrap();
        assert_eq!(pool.position(h, 0).unwrap(), 4);
        assert_eq!(pool.position(h, 1).unwrap(), 0);
    }

    #[test]
    fn read_past_cursor_is_position_invalid() {
        let mut pool = pool(32);
        let h = pool.allocate(8).unwrap();
        pool.write(h, 0, 0..2, &rows(2, 0.0), &rows(2, 0.0)).unwrap();
        assert!(matches!(
            pool.read(h, 0, 3),
            Err(CacheError::CachePositionInvalid { .. })
        ));
    }

    #[test]
    fn release_returns_capacity() {
        let mut pool = pool(16);
        let h = pool.allocate(12).unwrap();
        assert_eq!(pool.available(), 4);
        pool.release(h).unwrap();
        assert_eq!(pool.available(), 16);
    }

    #[test]
    fn double_release_is_detected() {
        let mut pool = pool(16);
        let h = pool.allocate(4).unwrap();
        pool.release(h).unwrap();
        assert!(matches!(
            pool.release(h),
            Err(CacheError::HandleNotAllocated { .. })
        ));
    }

    #[test]
    fn slot_view_appends_and_reads() {
        let mut pool = pool(32);
        let h = pool.allocate(8).unwrap();
        let k = rows(2, 3.0);
        {
            let mut slot = PooledSlot::new(&mut pool, h);
            slot.append(0, &k, &k).unwrap();
            assert_eq!(KvSlot::len(&slot), 2);
            let (wk, _) = slot.window(0).unwrap();
            assert_eq!(wk.dims(), &[2, 1, 4]);
        }
        assert_eq!(pool.position(h, 0).unwrap(), 2);
    }
}
