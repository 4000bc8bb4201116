use std::sync::Arc;

use candle_core::{DType, Device};
use tracing::{debug, warn};

use crate::kv_cache::{CacheConfig, CacheError, CachePool, PooledSlot};
use crate::model::{ForwardError, LanguageModel};
use crate::request::{FinishReason, SequenceStatus};
use crate::sampling::{self, SamplingParams};

use super::{Backend, BackendError, CacheBinding, DecodeSession, SequenceState};

/// Reference decode backend over contiguous per-sequence cache buffers.
///
/// Each admitted sequence reserves `prompt_len + max_generation_steps` tokens
/// of cache up front, so a sequence that is admitted can never run out of
/// room mid-decode. The price is that a batch whose total reservation exceeds
/// the pool is rejected outright.
pub struct VanillaBackend {
    model: Arc<dyn LanguageModel>,
    pool: CachePool,
}

impl VanillaBackend {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        config: CacheConfig,
        dtype: DType,
        device: Device,
    ) -> Result<Self, BackendError> {
        if config.num_layers != model.num_layers() {
            return Err(BackendError::InvalidState(format!(
                "cache configured for {} layers but model has {}",
                config.num_layers,
                model.num_layers()
            )));
        }
        let pool = CachePool::new(config, dtype, device)?;
        Ok(Self { model, pool })
    }

    fn release_binding(&mut self, seq: &mut SequenceState) {
        if let CacheBinding::Pooled(handle) = std::mem::take(&mut seq.cache) {
            if let Err(err) = self.pool.release(handle) {
                warn!(%err, "cache release failed");
            }
        }
    }

    fn prefill_forward(
        &mut self,
        sequences: &mut [SequenceState],
        params: &SamplingParams,
        max_generation_steps: usize,
    ) -> Result<(), BackendError> {
        let model = Arc::clone(&self.model);
        let eos = model.eos_token_id();
        for (i, seq) in sequences.iter_mut().enumerate() {
            if max_generation_steps == 0 {
                seq.finish(FinishReason::Length);
                self.release_binding(seq);
                continue;
            }
            seq.status = SequenceStatus::Prefilling;
            let CacheBinding::Pooled(handle) = &seq.cache else {
                return Err(BackendError::InvalidState(
                    "sequence lost its cache".to_string(),
                ));
            };
            let handle = *handle;
            let positions: Vec<usize> = (0..seq.prompt_token_ids.len()).collect();
            let mut slot = PooledSlot::new(&mut self.pool, handle);
            let logits = model.forward(&seq.prompt_token_ids, &positions, &mut slot)?;
            let (token, logprob) =
                sampling::choose_with_logprob(&logits, params, i, seq.next_step())?;
            seq.accept(token, logprob, eos, max_generation_steps);
            if seq.status.is_terminal() {
                self.release_binding(seq);
            }
        }
        Ok(())
    }
}

impl Backend for VanillaBackend {
    fn cache_size(&self) -> usize {
        self.pool.config().cache_size
    }

    fn eos_token_id(&self) -> u32 {
        self.model.eos_token_id()
    }

    fn pad_token_id(&self) -> u32 {
        self.model.pad_token_id()
    }

    fn prefill(
        &mut self,
        prompts: &[Vec<u32>],
        params: &SamplingParams,
        max_generation_steps: usize,
    ) -> Result<DecodeSession, BackendError> {
        params.validate()?;
        if prompts.iter().any(|p| p.is_empty()) {
            return Err(BackendError::InvalidState("empty prompt".to_string()));
        }

        // Reserve for every sequence first; admission is all-or-nothing.
        let mut sequences = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let mut seq = SequenceState::new(prompt.clone());
            match self.pool.allocate(prompt.len() + max_generation_steps) {
                Ok(handle) => seq.cache = CacheBinding::Pooled(handle),
                Err(err) => {
                    for earlier in &mut sequences {
                        self.release_binding(earlier);
                    }
                    return Err(err.into());
                }
            }
            sequences.push(seq);
        }

        // A failed batch must not keep its reservations.
        if let Err(err) = self.prefill_forward(&mut sequences, params, max_generation_steps) {
            for seq in &mut sequences {
                self.release_binding(seq);
            }
            return Err(err);
        }

        debug!(
            sequences = sequences.len(),
            max_generation_steps, "prefill complete"
        );
        Ok(DecodeSession::new(
            sequences,
            params.clone(),
            max_generation_steps,
        ))
    }

    fn decode_step(&mut self, session: &mut DecodeSession) -> Result<(), BackendError> {
        let model = Arc::clone(&self.model);
        let eos = model.eos_token_id();
        for i in session.active_indices() {
            let seq = &mut session.sequences[i];
            let CacheBinding::Pooled(handle) = &seq.cache else {
                return Err(BackendError::InvalidState(
                    "active sequence has no cache".to_string(),
                ));
            };
            let handle = *handle;
            let last = *seq
                .generated_token_ids
                .last()
                .ok_or_else(|| BackendError::InvalidState("decode before prefill".to_string()))?;
            let position = seq.prompt_token_ids.len() + seq.generated_token_ids.len() - 1;

            let mut slot = PooledSlot::new(&mut self.pool, handle);
            let logits = match model.forward(&[last], &[position], &mut slot) {
                Ok(logits) => logits,
                Err(ForwardError::Cache(CacheError::CacheExhausted { .. })) => {
                    seq.finish(FinishReason::Capacity);
                    self.release_binding(seq);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let (token, logprob) =
                sampling::choose_with_logprob(&logits, &session.params, i, seq.next_step())?;
            seq.accept(token, logprob, eos, session.max_generation_steps);
            if seq.status.is_terminal() {
                self.release_binding(seq);
            }
        }
        session.step += 1;
        Ok(())
    }

    fn cancel(
        &mut self,
        session: &mut DecodeSession,
        sequence_index: usize,
    ) -> Result<(), BackendError> {
        let seq = session
            .sequences
            .get_mut(sequence_index)
            .ok_or_else(|| BackendError::InvalidState(format!(
                "no sequence {sequence_index} in session"
            )))?;
        if seq.status.is_terminal() {
            return Ok(());
        }
        seq.status = SequenceStatus::Cancelled;
        self.release_binding(seq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::FinishReason;
    use crate::testing::{self, TinyLm};

    fn backend(cache_size: usize) -> VanillaBackend {
        let model = testing::quiet_model();
        VanillaBackend::new(
            model,
            testing::cache_config(cache_size),
            DType::F32,
            Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn prefill_samples_one_token_per_sequence() {
        let mut backend = backend(64);
        let session = backend
            .prefill(&[vec![2, 3], vec![4]], &SamplingParams::default(), 4)
            .unwrap();
        assert_eq!(session.sequences.len(), 2);
        for seq in &session.sequences {
            assert_eq!(seq.generated_token_ids.len(), 1);
            assert_eq!(seq.generated_logprobs.len(), 1);
        }
    }

    #[test]
    fn decode_runs_to_length() {
        let mut backend = backend(64);
        let mut session = backend
            .prefill(&[vec![2, 3, 4]], &SamplingParams::default(), 3)
            .unwrap();
        while !session.all_finished() {
            backend.decode_step(&mut session).unwrap();
        }
        let seq = &session.sequences[0];
        assert_eq!(seq.status, SequenceStatus::Finished(FinishReason::Length));
        assert_eq!(seq.generated_token_ids.len(), 3);
    }

    #[test]
    fn eos_stops_a_sequence_immediately() {
        let model = testing::eos_model();
        let mut backend =
            VanillaBackend::new(model, testing::cache_config(64), DType::F32, Device::Cpu)
                .unwrap();
        let session = backend
            .prefill(&[vec![2, 3]], &SamplingParams::default(), 4)
            .unwrap();
        let seq = &session.sequences[0];
        assert_eq!(seq.status, SequenceStatus::Finished(FinishReason::Eos));
        assert!(seq.generated_token_ids.is_empty());
    }

    #[test]
    fn oversized_batch_is_rejected_whole() {
        let mut backend = backend(8);
        // Each sequence needs 4 + 2 = 6 tokens; two cannot fit in 8.
        let err = backend
            .prefill(
                &[vec![2, 3, 4, 5], vec![6, 7, 8, 9]],
                &SamplingParams::default(),
                2,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            BackendError::Cache(CacheError::CacheExhausted { .. })
        ));
        // The failed batch must not leak its partial reservations.
        assert!(backend.pool.available() == 8);
    }

    #[test]
    fn failed_prefill_releases_every_reservation() {
        let model = testing::flaky_model(1);
        let mut backend =
            VanillaBackend::new(model, testing::cache_config(32), DType::F32, Device::Cpu)
                .unwrap();
        // Second prompt's forward fails; the first must not keep its slot.
        let err = backend
            .prefill(&[vec![2, 3, 4], vec![5, 6]], &SamplingParams::default(), 2)
            .unwrap_err();
        assert!(matches!(err, BackendError::Forward(_)));
        assert_eq!(backend.pool.available(), 32);
        // The pool is whole again, so the same batch can be retried.
        let session = backend
            .prefill(&[vec![2, 3, 4], vec![5, 6]], &SamplingParams::default(), 2)
            .unwrap();
        assert_eq!(session.sequences.len(), 2);
    }

    #[test]
    fn finished_sequences_release_their_cache() {
        let mut backend = backend(32);
        let mut session = backend
            .prefill(&[vec![2, 3]], &SamplingParams::default(), 2)
            .unwrap();
        while !session.all_finished() {
            backend.decode_step(&mut session).unwrap();
        }
        assert_eq!(backend.pool.available(), 32);
    }

    #[test]
    fn cancel_releases_and_marks_sequence() {
        let mut backend = backend(32);
        let mut session = backend
            .prefill(&[vec![2, 3]], &SamplingParams::default(), 8)
            .unwrap();
        backend.cancel(&mut session, 0).unwrap();
        assert_eq!(session.sequences[0].status, SequenceStatus::Cancelled);
        assert_eq!(backend.pool.available(), 32);
        // Cancelling twice is a no-op.
        backend.cancel(&mut session, 0).unwrap();
    }

    #[test]
    fn zero_step_budget_finishes_without_sampling() {
        let mut backend = backend(32);
        let session = backend
            .prefill(&[vec![2, 3]], &SamplingParams::default(), 0)
            .unwrap();
        let seq = &session.sequences[0];
        assert_eq!(seq.status, SequenceStatus::Finished(FinishReason::Length));
        assert!(seq.generated_token_ids.is_empty());
        assert_eq!(backend.pool.available(), 32);
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let mut backend = backend(32);
        let err = backend
            .prefill(&[vec![]], &SamplingParams::default(), 2)
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidState(_)));
    }

    #[test]
    fn greedy_decode_is_reproducible() {
        let params = SamplingParams {
            temperature: 0.0,
            ..Default::default()
        };
        let run = |cache: usize| {
            let mut backend = backend(cache);
            let mut session = backend.prefill(&[vec![2, 3, 4]], &params, 5).unwrap();
            while !session.all_finished() {
                backend.decode_step(&mut session).unwrap();
            }
            session.sequences[0].generated_token_ids.clone()
        };
        assert_eq!(run(64), run(64));
    }

    #[test]
    fn vocab_matches_model() {
        let backend = backend(16);
        assert_eq!(backend.eos_token_id(), TinyLm::EOS);
        assert_eq!(backend.pad_token_id(), TinyLm::PAD);
    }
}
