//! Deterministic toy model and fixtures shared by the test suites.
//!
//! `TinyLm` is a two-layer mean-pooling model: each layer appends the token
//! embeddings to the cache, the logits are a linear map of the mean of the
//! cached keys. Small enough to reason about by hand, but it exercises the
//! full cache and mapping surface, and its output depends on every cached
//! position, so cache-layout bugs show up as changed tokens.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::kv_cache::{CacheConfig, KvSlot};
use crate::mapping::{
    LoraConfig, MappingConfig, MappingError, MappingRule, MappingTarget, TransposeRule,
    UnmatchedKeyPolicy, WeightMapper,
};
use crate::model::{ForwardError, LanguageModel, ModelBuilder, ModelState, ModelWeightLayout};

pub struct TinyLm {
    embed: Tensor,
    lm_head: Tensor,
    vocab_size: usize,
    dim: usize,
    device: Device,
}

impl TinyLm {
    pub const VOCAB: usize = 12;
    pub const DIM: usize = 4;
    pub const LAYERS: usize = 2;
    pub const EOS: u32 = 1;
    pub const PAD: u32 = 0;
}

impl LanguageModel for TinyLm {
    fn num_layers(&self) -> usize {
        Self::LAYERS
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn eos_token_id(&self) -> u32 {
        Self::EOS
    }

    fn pad_token_id(&self) -> u32 {
        Self::PAD
    }

    fn forward(
        &self,
        token_ids: &[u32],
        positions: &[usize],
        cache: &mut dyn KvSlot,
    ) -> Result<Vec<f32>, ForwardError> {
        let n = token_ids.len();
        let ids = Tensor::from_vec(token_ids.to_vec(), (n,), &self.device)?;
        let x = self.embed.index_select(&ids, 0)?;
        let offsets = Tensor::from_vec(
            positions.iter().map(|&p| p as f32 * 0.001).collect::<Vec<_>>(),
            (n, 1),
            &self.device,
        )?;
        let x = x.broadcast_add(&offsets)?;

        let kv = x.reshape((n, 1, self.dim))?;
        for layer in 0..Self::LAYERS {
            cache.append(layer, &kv, &kv)?;
        }

        let (keys, _) = cache.window(Self::LAYERS - 1)?;
        let len = keys.dim(0)?;
        let mean = keys
            .reshape((len, self.dim))?
            .sum(0)?
            .affine(1.0 / len as f64, 0.0)?;
        let logits = self.lm_head.matmul(&mean.reshape((self.dim, 1))?)?;
        Ok(logits.reshape(self.vocab_size)?.to_vec1::<f32>()?)
    }
}

/// Builds a [`TinyLm`] from a backend-named state dict.
pub struct TinyLmBuilder;

impl ModelBuilder for TinyLmBuilder {
    fn required_keys(&self) -> Vec<String> {
        vec!["embedding.weight".to_string(), "lm_head.weight".to_string()]
    }

    fn build(&self, state: &ModelState) -> Result<Arc<dyn LanguageModel>, MappingError> {
        let embed = state
            .get("embedding.weight")
            .ok_or_else(|| MappingError::MissingKeys {
                keys: vec!["embedding.weight".to_string()],
            })?
            .clone();
        let lm_head = state
            .get("lm_head.weight")
            .ok_or_else(|| MappingError::MissingKeys {
                keys: vec!["lm_head.weight".to_string()],
            })?
            .clone();
        let (vocab_size, dim) = embed.dims2()?;
        let (head_vocab, head_dim) = lm_head.dims2()?;
        if (head_vocab, head_dim) != (vocab_size, dim) {
            return Err(MappingError::Candle(candle_core::Error::Msg(format!(
                "lm_head shape [{head_vocab}, {head_dim}] does not match embedding [{vocab_size}, {dim}]"
            ))));
        }
        let device = embed.device().clone();
        Ok(Arc::new(TinyLm {
            embed,
            lm_head,
            vocab_size,
            dim,
            device,
        }))
    }
}

/// Cache sizing that fits [`TinyLm`].
pub fn cache_config(cache_size: usize) -> CacheConfig {
    CacheConfig {
        cache_size,
        num_layers: TinyLm::LAYERS,
        num_kv_heads: 1,
        head_dim: TinyLm::DIM,
    }
}

/// Naming tables for TinyLm checkpoints. Native checkpoints carry
/// `embedder.input_embedding` (`[vocab, dim]`) and `lm_head.w`
/// (`[dim, vocab]`, transposed relative to the backend layout).
impl ModelWeightLayout for TinyLm {
    fn to_hf_mappings() -> Vec<MappingRule> {
        vec![
            MappingRule {
                pattern: r"embedder\.input_embedding".to_string(),
                template: "model.embed_tokens.weight".to_string(),
            },
            MappingRule {
                pattern: r"lm_head\.w".to_string(),
                template: "lm_head.weight".to_string(),
            },
        ]
    }

    fn to_backend_mapping() -> Vec<MappingRule> {
        vec![
            MappingRule {
                pattern: r"embedder\.input_embedding".to_string(),
                template: "embedding.weight".to_string(),
            },
            MappingRule {
                pattern: r"lm_head\.w".to_string(),
                template: "lm_head.weight".to_string(),
            },
        ]
    }

    fn to_hf_transpose_keys() -> Vec<TransposeRule> {
        vec![TransposeRule {
            pattern: r"lm_head\.w".to_string(),
            permutation: vec![1, 0],
        }]
    }

    fn lora_to_hf_mappings() -> Vec<MappingRule> {
        vec![MappingRule {
            pattern: r"embedder\.input_embedding".to_string(),
            template: "embedding.weight".to_string(),
        }]
    }
}

/// [`TinyLm`]'s naming tables with rank-2 adapter scaling enabled.
pub fn mapping_config() -> MappingConfig {
    MappingConfig {
        lora_config: Some(LoraConfig {
            rank: 2,
            alpha: 4.0,
            module_path: Some(r"embedder\.input_embedding".to_string()),
        }),
        unmatched: UnmatchedKeyPolicy::PassThrough,
        ..TinyLm::mapping_config()
    }
}

fn checkpoint(eos_bias: f32) -> ModelState {
    let device = Device::Cpu;
    let v = TinyLm::VOCAB;
    let d = TinyLm::DIM;

    // Channel 0 of every embedding is 1.0, so the pooled mean always carries
    // a positive constant there no matter which tokens were cached. The
    // remaining channels vary per token.
    let mut embed = vec![0.0f32; v * d];
    for tok in 0..v {
        embed[tok * d] = 1.0;
        for c in 1..d {
            embed[tok * d + c] = ((tok * d + c) as f32 * 0.3).sin();
        }
    }

    // Native layout [dim, vocab]. The EOS column reads only the constant
    // channel, so its logit tracks `eos_bias` independently of the prompt;
    // every other column reads only the varying channels and stays within a
    // few units of zero.
    let mut head = vec![0.0f32; d * v];
    for row in 1..d {
        for col in 0..v {
            if col != TinyLm::EOS as usize {
                head[row * v + col] = ((row * v + col) as f32 * 0.17).cos();
            }
        }
    }
    head[TinyLm::EOS as usize] = eos_bias;

    let mut state = ModelState::new();
    state.insert(
        "embedder.input_embedding".to_string(),
        Tensor::from_vec(embed, (v, d), &device).expect("embedding tensor"),
    );
    state.insert(
        "lm_head.w".to_string(),
        Tensor::from_vec(head, (d, v), &device).expect("lm_head tensor"),
    );
    state
}

/// Native-named checkpoint whose argmax never lands on EOS.
pub fn quiet_checkpoint() -> ModelState {
    checkpoint(-12.0)
}

/// Native-named checkpoint that emits EOS on the first step.
pub fn eos_checkpoint() -> ModelState {
    checkpoint(12.0)
}

/// Attach rank-2 LoRA factors for the embedding to a native checkpoint.
pub fn add_embedding_lora(state: &mut ModelState) {
    let device = Device::Cpu;
    let rank = 2;
    let a: Vec<f32> = (0..rank * TinyLm::DIM).map(|i| (i as f32 * 0.11).sin()).collect();
    let b: Vec<f32> = (0..TinyLm::VOCAB * rank).map(|i| (i as f32 * 0.07).cos()).collect();
    state.insert(
        "embedder.input_embedding.lora_a".to_string(),
        Tensor::from_vec(a, (rank, TinyLm::DIM), &device).expect("lora_a tensor"),
    );
    state.insert(
        "embedder.input_embedding.lora_b".to_string(),
        Tensor::from_vec(b, (TinyLm::VOCAB, rank), &device).expect("lora_b tensor"),
    );
}

fn model_from(state: ModelState) -> Arc<dyn LanguageModel> {
    let mapper = WeightMapper::new(mapping_config()).expect("compile mapping config");
    let mapped = mapper
        .to_backend(&state, MappingTarget::Backend)
        .expect("map checkpoint");
    TinyLmBuilder.build(&mapped).expect("build model")
}

pub fn quiet_model() -> Arc<dyn LanguageModel> {
    model_from(quiet_checkpoint())
}

pub fn eos_model() -> Arc<dyn LanguageModel> {
    model_from(eos_checkpoint())
}

/// Fails exactly one forward call, counted across the model's lifetime.
struct FlakyLm {
    inner: Arc<dyn LanguageModel>,
    failing_call: usize,
    calls: AtomicUsize,
}

impl LanguageModel for FlakyLm {
    fn num_layers(&self) -> usize {
        self.inner.num_layers()
    }

    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }

    fn eos_token_id(&self) -> u32 {
        self.inner.eos_token_id()
    }

    fn pad_token_id(&self) -> u32 {
        self.inner.pad_token_id()
    }

    fn forward(
        &self,
        token_ids: &[u32],
        positions: &[usize],
        cache: &mut dyn KvSlot,
    ) -> Result<Vec<f32>, ForwardError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == self.failing_call {
            return Err(ForwardError::Tensor(candle_core::Error::Msg(
                "injected forward failure".to_string(),
            )));
        }
        self.inner.forward(token_ids, positions, cache)
    }
}

/// Quiet model whose forward errors on call number `failing_call` (0-based)
/// and succeeds on every other call.
pub fn flaky_model(failing_call: usize) -> Arc<dyn LanguageModel> {
    Arc::new(FlakyLm {
        inner: quiet_model(),
        failing_call,
        calls: AtomicUsize::new(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_cache::{CachePool, PooledSlot};
    use candle_core::DType;

    #[test]
    fn builder_accepts_mapped_reference_checkpoint() {
        let mapper = WeightMapper::new(mapping_config()).unwrap();
        let mapped = mapper
            .to_backend(&quiet_checkpoint(), MappingTarget::Backend)
            .unwrap();
        WeightMapper::validate_against(&mapped, &TinyLmBuilder.required_keys()).unwrap();
        let model = TinyLmBuilder.build(&mapped).unwrap();
        assert_eq!(model.vocab_size(), TinyLm::VOCAB);
        assert_eq!(model.num_layers(), TinyLm::LAYERS);
    }

    #[test]
    fn forward_returns_vocab_sized_logits() {
        let model = quiet_model();
        let mut pool = CachePool::new(cache_config(16), DType::F32, Device::Cpu).unwrap();
        let handle = pool.allocate(8).unwrap();
        let mut slot = PooledSlot::new(&mut pool, handle);
        let logits = model.forward(&[2, 3, 4], &[0, 1, 2], &mut slot).unwrap();
        assert_eq!(logits.len(), TinyLm::VOCAB);
        assert_eq!(slot.window(0).unwrap().0.dims(), &[3, 1, TinyLm::DIM]);
    }

    #[test]
    fn eos_preference_is_prompt_independent() {
        let quiet = quiet_model();
        let eos = eos_model();
        for prompt in [&[2u32, 3][..], &[5, 6, 7], &[11]] {
            let positions: Vec<usize> = (0..prompt.len()).collect();

            let mut pool = CachePool::new(cache_config(16), DType::F32, Device::Cpu).unwrap();
            let handle = pool.allocate(8).unwrap();
            let mut slot = PooledSlot::new(&mut pool, handle);
            let logits = quiet.forward(prompt, &positions, &mut slot).unwrap();
            let eos_logit = logits[TinyLm::EOS as usize];
            assert!(
                logits.iter().any(|&l| l > eos_logit),
                "quiet model prefers EOS for prompt {prompt:?}"
            );

            let mut pool = CachePool::new(cache_config(16), DType::F32, Device::Cpu).unwrap();
            let handle = pool.allocate(8).unwrap();
            let mut slot = PooledSlot::new(&mut pool, handle);
            let logits = eos.forward(prompt, &positions, &mut slot).unwrap();
            let argmax = logits
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(i, _)| i as u32)
                .unwrap();
            assert_eq!(
                argmax,
                TinyLm::EOS,
                "eos model suppresses EOS for prompt {prompt:?}"
            );
        }
    }

    #[test]
    fn flaky_model_fails_exactly_once() {
        let model = flaky_model(1);
        let mut pool = CachePool::new(cache_config(16), DType::F32, Device::Cpu).unwrap();
        let handle = pool.allocate(12).unwrap();
        let mut slot = PooledSlot::new(&mut pool, handle);
        assert!(model.forward(&[2], &[0], &mut slot).is_ok());
        assert!(model.forward(&[3], &[1], &mut slot).is_err());
        assert!(model.forward(&[4], &[2], &mut slot).is_ok());
    }

    #[test]
    fn lora_factors_change_the_embedding() {
        let mapper = WeightMapper::new(mapping_config()).unwrap();
        let plain = mapper
            .to_backend(&quiet_checkpoint(), MappingTarget::Backend)
            .unwrap();
        let mut with_lora = quiet_checkpoint();
        add_embedding_lora(&mut with_lora);
        let merged = mapper
            .to_backend(&with_lora, MappingTarget::Backend)
            .unwrap();
        assert!(!merged.contains_key("embedder.input_embedding.lora_a"));
        let before = plain["embedding.weight"].to_vec2::<f32>().unwrap();
        let after = merged["embedding.weight"].to_vec2::<f32>().unwrap();
        assert_ne!(before, after);
    }
}
