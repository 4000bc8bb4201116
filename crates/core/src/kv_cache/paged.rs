use candle_core::{DType, Device, Tensor};

use super::block_table::BlockTable;
use super::error::CacheError;
use super::KvSlot;

/// Slot-granular KV arena shared by every sequence of the paged backend.
///
/// Per-layer K/V tensors are kept flat as `[num_blocks * block_size,
/// num_kv_heads, head_dim]`; a sequence's [`BlockTable`] turns token
/// positions into rows of this arena. Writes scatter into the flat tensor,
/// reads gather rows back in position order, so the values a model sees are
/// bit-identical to the contiguous pool's.
pub struct PagedKvCache {
    k: Vec<Tensor>,
    v: Vec<Tensor>,
    num_slots: usize,
    num_kv_heads: usize,
    head_dim: usize,
    device: Device,
}

impl PagedKvCache {
    pub fn new(
        num_blocks: usize,
        block_size: usize,
        num_layers: usize,
        num_kv_heads: usize,
        head_dim: usize,
        dtype: DType,
        device: Device,
    ) -> Result<Self, CacheError> {
        let num_slots = num_blocks * block_size;
        let shape = (num_slots, num_kv_heads, head_dim);
        let mut k = Vec::with_capacity(num_layers);
        let mut v = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            k.push(Tensor::zeros(shape, dtype, &device)?);
            v.push(Tensor::zeros(shape, dtype, &device)?);
        }
        Ok(Self {
            k,
            v,
            num_slots,
            num_kv_heads,
            head_dim,
            device,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.k.len()
    }

    fn check_layer(&self, layer: usize) -> Result<(), CacheError> {
        if layer >= self.k.len() {
            return Err(CacheError::LayerOutOfRange {
                layer,
                num_layers: self.k.len(),
            });
        }
        Ok(())
    }

    /// Scatter `keys`/`values` (`[n, num_kv_heads, head_dim]`) into the given
    /// arena slots.
    pub fn write(
        &mut self,
        layer: usize,
        slots: &[usize],
        keys: &Tensor,
        values: &Tensor,
    ) -> Result<(), CacheError> {
        self.check_layer(layer)?;
        if let Some(&slot) = slots.iter().find(|&&s| s >= self.num_slots) {
            return Err(CacheError::CachePositionInvalid {
                layer,
                position: slot,
                expected: self.num_slots,
            });
        }
        let n = slots.len();
        let indices = Tensor::from_vec(
            slots.iter().map(|&s| s as u32).collect::<Vec<_>>(),
            (n,),
            &self.device,
        )?
        .reshape((n, 1, 1))?
        .expand((n, self.num_kv_heads, self.head_dim))?
        .contiguous()?;
        self.k[layer].scatter_set(&indices, &keys.contiguous()?, 0)?;
        self.v[layer].scatter_set(&indices, &values.contiguous()?, 0)?;
        Ok(())
    }

    /// Gather rows for the given slots, in order.
    pub fn gather(&self, layer: usize, slots: &[usize]) -> Result<(Tensor, Tensor), CacheError> {
        self.check_layer(layer)?;
        let indices = Tensor::from_vec(
            slots.iter().map(|&s| s as u32).collect::<Vec<_>>(),
            (slots.len(),),
            &self.device,
        )?;
        let k = self.k[layer].index_select(&indices, 0)?;
        let v = self.v[layer].index_select(&indices, 0)?;
        Ok((k, v))
    }
}

/// [`KvSlot`] view binding one sequence's block table to the shared arena.
///
/// Token accounting follows layer 0: every layer of a forward pass must
/// append the same position range, and layer 0 must go first.
pub struct PagedSlot<'a> {
    cache: &'a mut PagedKvCache,
    table: &'a mut BlockTable,
}

impl<'a> PagedSlot<'a> {
    pub fn new(cache: &'a mut PagedKvCache, table: &'a mut BlockTable) -> Self {
        Self { cache, table }
    }
}

impl KvSlot for PagedSlot<'_> {
    fn len(&self) -> usize {
        self.table.num_tokens()
    }

    fn append(&mut self, layer: usize, keys: &Tensor, values: &Tensor) -> Result<(), CacheError> {
        let n = keys.dim(0)?;
        let start = if layer == 0 {
            self.table.num_tokens()
        } else {
            // Layer 0 already advanced the table for this step.
            self.table.num_tokens() - n
        };
        let slots = self.table.slot_mapping(start, n);
        self.cache.write(layer, &slots, keys, values)?;
        if layer == 0 {
            self.table.advance(n);
        }
        Ok(())
    }

    fn window(&self, layer: usize) -> Result<(Tensor, Tensor), CacheError> {
        let slots = self.table.slot_mapping(0, self.table.num_tokens());
        self.cache.gather(layer, &slots)
    }
}
