use std::collections::HashMap;
use std::sync::Arc;

use candle_core::Tensor;
use thiserror::Error;

use crate::kv_cache::{CacheError, KvSlot};
use crate::mapping::{MappingConfig, MappingError, MappingRule, TransposeRule};

/// A checkpoint's weights, keyed by tensor name.
pub type ModelState = HashMap<String, Tensor>;

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

/// A decoder-only model as the backends see it.
///
/// `forward` consumes `token_ids` at `positions`, appends their K/V to every
/// layer of `cache` and returns the logits of the last position as a dense
/// `vocab_size` vector. Backends rely on this being deterministic for a given
/// cache content, whatever the cache layout.
pub trait LanguageModel: Send + Sync {
    fn num_layers(&self) -> usize;
    fn vocab_size(&self) -> usize;
    fn eos_token_id(&self) -> u32;
    fn pad_token_id(&self) -> u32;

    fn forward(
        &self,
        token_ids: &[u32],
        positions: &[usize],
        cache: &mut dyn KvSlot,
    ) -> Result<Vec<f32>, ForwardError>;
}

/// Instantiates a [`LanguageModel`] from an already-mapped state dict.
pub trait ModelBuilder: Send + Sync {
    /// Exact key set `build` expects, in the backend's naming.
    fn required_keys(&self) -> Vec<String>;

    fn build(&self, state: &ModelState) -> Result<Arc<dyn LanguageModel>, MappingError>;
}

/// Per-model-family naming tables, bundled into a [`MappingConfig`].
pub trait ModelWeightLayout {
    fn to_hf_mappings() -> Vec<MappingRule>;
    fn to_backend_mapping() -> Vec<MappingRule>;

    fn to_hf_transpose_keys() -> Vec<TransposeRule> {
        Vec::new()
    }

    fn lora_to_hf_mappings() -> Vec<MappingRule> {
        Vec::new()
    }

    fn mapping_config() -> MappingConfig {
        MappingConfig {
            to_hf_mappings: Self::to_hf_mappings(),
            to_backend_mapping: Self::to_backend_mapping(),
            transpose_keys: Self::to_hf_transpose_keys(),
            lora_to_hf_mappings: Self::lora_to_hf_mappings(),
            lora_config: None,
            unmatched: Default::default(),
        }
    }
}
