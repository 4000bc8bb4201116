//! End-to-end generation orchestrator.
//!
//! A [`Sampler`] owns a tokenizer and one decode backend and turns a
//! [`GenerationRequest`] into decoded text. The vanilla flavor is built
//! around an already-instantiated model; the optimized flavor takes a
//! [`ModelBuilder`] plus a mapping config and materializes its model when a
//! checkpoint is loaded.

use candle_core::{DType, Device};
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{Backend, BackendError, OptimizedBackend, VanillaBackend};
use crate::kv_cache::CacheConfig;
use crate::mapping::{MappingConfig, MappingError, MappingTarget, WeightMapper};
use crate::model::{LanguageModel, ModelBuilder, ModelState};
use crate::request::{GenerationRequest, GenerationResult};
use crate::sampling::SamplingError;
use crate::tokenizer::TokenizerWrapper;

use std::sync::Arc;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("sampler configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Sampling(#[from] SamplingError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("tokenizer: {0}")]
    Tokenizer(anyhow::Error),
    #[error(
        "backends diverge at sequence {sequence}, step {step}: {left:?} vs {right:?}"
    )]
    BackendMismatch {
        sequence: usize,
        step: usize,
        left: Option<u32>,
        right: Option<u32>,
    },
}

/// Everything the optimized flavor needs besides the model builder.
pub struct OptimizedSamplerConfig {
    pub cache_config: CacheConfig,
    pub mapping_config: MappingConfig,
    pub block_size: usize,
    pub dtype: DType,
    pub device: Device,
}

enum Engine {
    /// Backend exists from construction; checkpoints are already baked in.
    Ready(Box<dyn Backend>),
    /// Backend materializes on `load_checkpoint` and is rebuilt on reload.
    Optimized {
        builder: Box<dyn ModelBuilder>,
        mapper: WeightMapper,
        config: OptimizedSamplerConfig,
        backend: Option<Box<dyn Backend>>,
    },
}

pub struct Sampler {
    tokenizer: TokenizerWrapper,
    engine: Engine,
}

impl Sampler {
    /// Reference sampler over the contiguous-cache backend.
    pub fn vanilla(
        tokenizer: TokenizerWrapper,
        model: Arc<dyn LanguageModel>,
        cache_config: CacheConfig,
        dtype: DType,
        device: Device,
    ) -> Result<Self, SamplerError> {
        let backend = VanillaBackend::new(model, cache_config, dtype, device)?;
        Ok(Self {
            tokenizer,
            engine: Engine::Ready(Box::new(backend)),
        })
    }

    /// Paged sampler. No generation is possible until `load_checkpoint`.
    pub fn optimized(
        tokenizer: TokenizerWrapper,
        builder: Box<dyn ModelBuilder>,
        config: OptimizedSamplerConfig,
    ) -> Result<Self, SamplerError> {
        let mapper = WeightMapper::new(config.mapping_config.clone())?;
        Ok(Self {
            tokenizer,
            engine: Engine::Optimized {
                builder,
                mapper,
                config,
                backend: None,
            },
        })
    }

    /// Map, validate and install a checkpoint. Idempotent: loading the same
    /// state again rebuilds an equivalent backend.
    ///
    /// For the vanilla flavor this is a no-op; its model already holds its
    /// weights. For the optimized flavor the native state is translated to
    /// the backend naming, checked against the builder's required keys and
    /// turned into a fresh backend before any request is accepted.
    pub fn load_checkpoint(&mut self, state: &ModelState) -> Result<(), SamplerError> {
        let Engine::Optimized {
            builder,
            mapper,
            config,
            backend,
        } = &mut self.engine
        else {
            return Ok(());
        };

        let mapped = mapper.to_backend(state, MappingTarget::Backend)?;
        WeightMapper::validate_against(&mapped, &builder.required_keys())?;
        let model = builder.build(&mapped)?;
        let fresh = OptimizedBackend::new(
            model,
            config.cache_config.clone(),
            config.block_size,
            config.dtype,
            config.device.clone(),
        )?;
        info!(
            cache_size = fresh.cache_size(),
            "checkpoint loaded, paged backend ready"
        );
        *backend = Some(Box::new(fresh));
        Ok(())
    }

    /// Run one batched generation call to completion.
    pub fn generate(
        &mut self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, SamplerError> {
        let params = request.sampling_params();
        params.validate()?;

        let max_steps = request.max_generation_steps;
        let tokenizer = &self.tokenizer;
        let backend = match &mut self.engine {
            Engine::Ready(b) => b.as_mut(),
            Engine::Optimized {
                backend: Some(b), ..
            } => b.as_mut(),
            Engine::Optimized { backend: None, .. } => {
                return Err(SamplerError::Configuration(
                    "no checkpoint loaded".to_string(),
                ))
            }
        };

        let cache_size = backend.cache_size();
        if max_steps > cache_size {
            return Err(SamplerError::Configuration(format!(
                "max_generation_steps {max_steps} exceeds cache size {cache_size}"
            )));
        }
        let max_prompt = match request.max_prompt_length {
            Some(len) => len,
            None => cache_size - max_steps,
        };
        if max_prompt == 0 {
            return Err(SamplerError::Configuration(
                "no room left for any prompt token".to_string(),
            ));
        }

        let mut prompts = Vec::with_capacity(request.input_strings.len());
        for text in &request.input_strings {
            let ids = tokenizer
                .encode_truncated(text, max_prompt)
                .map_err(SamplerError::Tokenizer)?;
            if ids.is_empty() {
                return Err(SamplerError::Configuration(format!(
                    "input produced no tokens: {text:?}"
                )));
            }
            prompts.push(ids);
        }

        let mut session = backend.prefill(&prompts, &params, max_steps)?;
        while !session.all_finished() {
            if let Err(err) = backend.decode_step(&mut session) {
                // An abandoned session must not keep its cache.
                for i in 0..session.sequences.len() {
                    if let Err(cancel_err) = backend.cancel(&mut session, i) {
                        warn!(%cancel_err, sequence = i, "cleanup cancel failed");
                    }
                }
                return Err(err.into());
            }
        }
        info!(
            sequences = session.sequences.len(),
            steps = session.step,
            "generation complete"
        );

        let pad = backend.pad_token_id();
        let mut text = Vec::with_capacity(session.sequences.len());
        let mut tokens = Vec::with_capacity(session.sequences.len());
        let mut logprobs = Vec::with_capacity(session.sequences.len());
        for seq in &session.sequences {
            let mut row = if request.echo {
                let mut ids = seq.prompt_token_ids.clone();
                ids.extend_from_slice(&seq.generated_token_ids);
                ids
            } else {
                seq.generated_token_ids.clone()
            };
            text.push(self.tokenizer.decode(&row).map_err(SamplerError::Tokenizer)?);
            logprobs.push(seq.generated_logprobs.clone());
            tokens.push(std::mem::take(&mut row));
        }
        if request.pad_output {
            let widest = tokens.iter().map(Vec::len).max().unwrap_or(0);
            for row in &mut tokens {
                row.resize(widest, pad);
            }
        }

        Ok(GenerationResult {
            text,
            tokens,
            logprobs: Some(logprobs),
        })
    }
}

/// Run the same request through two samplers and fail on the first token
/// where their outputs differ.
///
/// Only meaningful for greedy requests; anything with `temperature > 0.0` is
/// rejected so a seed mix-up cannot masquerade as backend divergence.
pub fn check_backend_equivalence(
    left: &mut Sampler,
    right: &mut Sampler,
    request: &GenerationRequest,
) -> Result<(), SamplerError> {
    if request.temperature != 0.0 {
        return Err(SamplerError::Configuration(
            "equivalence checks require temperature 0.0".to_string(),
        ));
    }
    let left_out = left.generate(request)?;
    let right_out = right.generate(request)?;
    for (sequence, (l, r)) in left_out.tokens.iter().zip(&right_out.tokens).enumerate() {
        let steps = l.len().max(r.len());
        for step in 0..steps {
            let lt = l.get(step).copied();
            let rt = r.get(step).copied();
            if lt != rt {
                return Err(SamplerError::BackendMismatch {
                    sequence,
                    step,
                    left: lt,
                    right: rt,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TinyLm, TinyLmBuilder};

    fn vanilla(cache_size: usize) -> Sampler {
        Sampler::vanilla(
            TokenizerWrapper::for_testing(TinyLm::VOCAB),
            testing::quiet_model(),
            testing::cache_config(cache_size),
            DType::F32,
            Device::Cpu,
        )
        .unwrap()
    }

    fn optimized(cache_size: usize) -> Sampler {
        Sampler::optimized(
            TokenizerWrapper::for_testing(TinyLm::VOCAB),
            Box::new(TinyLmBuilder),
            OptimizedSamplerConfig {
                cache_config: testing::cache_config(cache_size),
                mapping_config: testing::mapping_config(),
                block_size: 4,
                dtype: DType::F32,
                device: Device::Cpu,
            },
        )
        .unwrap()
    }

    #[test]
    fn generate_before_checkpoint_is_a_configuration_error() {
        let mut sampler = optimized(32);
        let err = sampler
            .generate(&GenerationRequest::greedy(vec!["t2 t3".to_string()], 2))
            .unwrap_err();
        assert!(matches!(err, SamplerError::Configuration(_)));
    }

    #[test]
    fn vanilla_needs_no_checkpoint() {
        let mut sampler = vanilla(32);
        sampler.load_checkpoint(&ModelState::new()).unwrap();
        let out = sampler
            .generate(&GenerationRequest::greedy(vec!["t2 t3".to_string()], 3))
            .unwrap();
        assert_eq!(out.tokens.len(), 1);
        assert_eq!(out.tokens[0].len(), 3);
    }

    #[test]
    fn optimized_generates_after_checkpoint() {
        let mut sampler = optimized(32);
        sampler.load_checkpoint(&testing::quiet_checkpoint()).unwrap();
        let out = sampler
            .generate(&GenerationRequest::greedy(vec!["t2 t3".to_string()], 3))
            .unwrap();
        assert_eq!(out.tokens[0].len(), 3);
    }

    #[test]
    fn reloading_the_same_checkpoint_is_idempotent() {
        let request = GenerationRequest::greedy(vec!["t2 t3".to_string()], 3);
        let mut sampler = optimized(32);
        sampler.load_checkpoint(&testing::quiet_checkpoint()).unwrap();
        let first = sampler.generate(&request).unwrap();
        sampler.load_checkpoint(&testing::quiet_checkpoint()).unwrap();
        let second = sampler.generate(&request).unwrap();
        assert_eq!(first.tokens, second.tokens);
    }

    #[test]
    fn missing_lora_factor_surfaces_as_mapping_error() {
        let mut sampler = optimized(32);
        let mut state = testing::quiet_checkpoint();
        state.insert(
            "embedder.input_embedding.lora_a".to_string(),
            state["embedder.input_embedding"].clone(),
        );
        let err = sampler.load_checkpoint(&state).unwrap_err();
        assert!(matches!(
            err,
            SamplerError::Mapping(MappingError::AdapterResolution { .. })
        ));
    }

    #[test]
    fn greedy_generation_is_reproducible() {
        let request = GenerationRequest::greedy(vec!["t2 t3 t4".to_string()], 4);
        let first = vanilla(32).generate(&request).unwrap();
        let second = vanilla(32).generate(&request).unwrap();
        assert_eq!(first.tokens, second.tokens);
        assert_eq!(first.text, second.text);
    }

    #[test]
    fn echo_prepends_the_prompt() {
        let mut request = GenerationRequest::greedy(vec!["t2 t3".to_string()], 2);
        let plain = vanilla(32).generate(&request).unwrap();
        request.echo = true;
        let echoed = vanilla(32).generate(&request).unwrap();
        assert_eq!(echoed.tokens[0][..2], [2, 3]);
        assert_eq!(echoed.tokens[0][2..], plain.tokens[0][..]);
        assert!(echoed.text[0].starts_with("t2 t3"));
        // Logprobs cover generated tokens only, echoed or not.
        assert_eq!(echoed.logprobs.as_ref().unwrap()[0].len(), 2);
    }

    #[test]
    fn pad_output_aligns_rows_without_touching_text() {
        let mut sampler = Sampler::vanilla(
            TokenizerWrapper::for_testing(TinyLm::VOCAB),
            testing::eos_model(),
            testing::cache_config(64),
            DType::F32,
            Device::Cpu,
        )
        .unwrap();
        // The EOS-biased model generates nothing, so with echo the rows are
        // exactly the prompts and differ in length.
        let mut request = GenerationRequest::greedy(
            vec!["t2 t3 t4".to_string(), "t5".to_string()],
            3,
        );
        request.echo = true;
        request.pad_output = true;
        let out = sampler.generate(&request).unwrap();
        assert_eq!(out.tokens[0].len(), out.tokens[1].len());
        assert!(out.tokens[1].ends_with(&[TinyLm::PAD, TinyLm::PAD]));
        // Text is decoded before padding, so no pad words leak in.
        assert_eq!(out.text[1], "t5");
    }

    #[test]
    fn decode_failure_returns_cache_to_the_pool() {
        let mut sampler = Sampler::vanilla(
            TokenizerWrapper::for_testing(TinyLm::VOCAB),
            testing::flaky_model(1),
            testing::cache_config(4),
            DType::F32,
            Device::Cpu,
        )
        .unwrap();
        // Prompt plus budget fills the cache exactly, so a leaked binding
        // would make the retry impossible to admit.
        let request = GenerationRequest::greedy(vec!["t2 t3".to_string()], 2);
        let err = sampler.generate(&request).unwrap_err();
        assert!(matches!(err, SamplerError::Backend(_)));
        let out = sampler.generate(&request).unwrap();
        assert_eq!(out.tokens[0].len(), 2);
    }

    #[test]
    fn oversized_step_budget_is_rejected() {
        let mut sampler = vanilla(8);
        let err = sampler
            .generate(&GenerationRequest::greedy(vec!["t2".to_string()], 9))
            .unwrap_err();
        assert!(matches!(err, SamplerError::Configuration(_)));
    }

    #[test]
    fn long_prompts_keep_their_tail() {
        let mut sampler = vanilla(8);
        let mut request = GenerationRequest::greedy(
            vec!["t1 t2 t3 t4 t5 t6 t7 t8 t9".to_string()],
            2,
        );
        request.echo = true;
        let out = sampler.generate(&request).unwrap();
        // Cache of 8 minus 2 steps leaves 6 prompt tokens: the last 6.
        assert_eq!(out.tokens[0][..6], [4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn invalid_params_are_rejected_before_any_work() {
        let mut sampler = vanilla(16);
        let mut request = GenerationRequest::greedy(vec!["t2".to_string()], 2);
        request.temperature = -1.0;
        assert!(matches!(
            sampler.generate(&request).unwrap_err(),
            SamplerError::Sampling(_)
        ));
        request.temperature = 1.0;
        request.top_p = Some(1.5);
        assert!(matches!(
            sampler.generate(&request).unwrap_err(),
            SamplerError::Sampling(_)
        ));
    }

    #[test]
    fn equivalence_check_requires_greedy() {
        let mut left = vanilla(32);
        let mut right = vanilla(32);
        let mut request = GenerationRequest::greedy(vec!["t2".to_string()], 2);
        request.temperature = 0.7;
        assert!(matches!(
            check_backend_equivalence(&mut left, &mut right, &request).unwrap_err(),
            SamplerError::Configuration(_)
        ));
    }

    #[test]
    fn equivalence_check_catches_divergence() {
        let mut left = vanilla(32);
        let mut right = Sampler::vanilla(
            TokenizerWrapper::for_testing(TinyLm::VOCAB),
            testing::eos_model(),
            testing::cache_config(32),
            DType::F32,
            Device::Cpu,
        )
        .unwrap();
        let request = GenerationRequest::greedy(vec!["t2 t3".to_string()], 3);
        match check_backend_equivalence(&mut left, &mut right, &request) {
            Err(SamplerError::BackendMismatch {
                sequence, step, right, ..
            }) => {
                assert_eq!(sequence, 0);
                assert_eq!(step, 0);
                assert_eq!(right, None);
            }
            other => panic!("expected BackendMismatch, got {other:?}"),
        }
    }
}
