use std::sync::Arc;

use candle_core::{DType, Device};
use tracing::{debug, warn};

use crate::kv_cache::{BlockPool, BlockTable, CacheConfig, CacheError, PagedKvCache, PagedSlot};
use crate::model::LanguageModel;
use crate::request::{FinishReason, SequenceStatus};
use crate::sampling::{self, SamplingParams};

use super::{Backend, BackendError, CacheBinding, DecodeSession, SequenceState};

/// Paged decode backend.
///
/// KV storage is a shared slot arena carved into fixed-size blocks. A
/// sequence claims blocks lazily as it grows, so cache that the vanilla
/// backend would hold in reserve stays available to other sequences. When
/// the arena runs dry mid-decode, only the sequence that needed the next
/// block finishes early; the rest keep going.
pub struct OptimizedBackend {
    model: Arc<dyn LanguageModel>,
    cache: PagedKvCache,
    blocks: BlockPool,
    block_size: usize,
    cache_size: usize,
}

impl OptimizedBackend {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        config: CacheConfig,
        block_size: usize,
        dtype: DType,
        device: Device,
    ) -> Result<Self, BackendError> {
        config.validate()?;
        if config.num_layers != model.num_layers() {
            return Err(BackendError::InvalidState(format!(
                "cache configured for {} layers but model has {}",
                config.num_layers,
                model.num_layers()
            )));
        }
        if block_size == 0 {
            return Err(BackendError::InvalidState("block_size must be non-zero".to_string()));
        }
        let num_blocks = config.cache_size / block_size;
        if num_blocks == 0 {
            return Err(BackendError::InvalidState(format!(
                "cache_size {} is smaller than one block of {block_size}",
                config.cache_size
            )));
        }
        let cache = PagedKvCache::new(
            num_blocks,
            block_size,
            config.num_layers,
            config.num_kv_heads,
            config.head_dim,
            dtype,
            device,
        )?;
        let blocks = BlockPool::new(num_blocks);
        Ok(Self {
            model,
            cache,
            cache_size: blocks.capacity() * block_size,
            blocks,
            block_size,
        })
    }

    fn free_binding(&mut self, seq: &mut SequenceState) {
        if let CacheBinding::Paged(mut table) = std::mem::take(&mut seq.cache) {
            let ids = table.release();
            if let Err(err) = self.blocks.free(&ids) {
                warn!(%err, "block free failed");
            }
        }
    }

    /// Grow a sequence's block table so `additional` more tokens fit.
    fn grow(
        table: &mut BlockTable,
        blocks: &mut BlockPool,
        additional: usize,
    ) -> Result<(), CacheError> {
        let needed = table.blocks_needed(additional);
        if needed > 0 {
            let ids = blocks.allocate(needed)?;
            table.append_blocks(&ids);
        }
        Ok(())
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
            if seq.status.is_terminal() {
                continue;
            }
            seq.status = SequenceStatus::Prefilling;
            let CacheBinding::Paged(table) = &mut seq.cache else {
                return Err(BackendError::InvalidState(
                    "sequence lost its cache".to_string(),
                ));
            };
            let positions: Vec<usize> = (0..seq.prompt_token_ids.len()).collect();
            let mut slot = PagedSlot::new(&mut self.cache, table);
            let logits = model.forward(&seq.prompt_token_ids, &positions, &mut slot)?;
            let (token, logprob) =
                sampling::choose_with_logprob(&logits, params, i, seq.next_step())?;
            seq.accept(token, logprob, eos, max_generation_steps);
            if seq.status.is_terminal() {
                self.free_binding(seq);
            }
        }
        Ok(())
    }
}

impl Backend for OptimizedBackend {
    fn cache_size(&self) -> usize {
        self.cache_size
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

        // Admission is all-or-nothing on the prompts themselves; generated
        // tokens claim blocks as they arrive.
        let prompt_blocks: usize = prompts
            .iter()
            .map(|p| p.len().div_ceil(self.block_size))
            .sum();
        if prompt_blocks > self.blocks.available() {
            return Err(CacheError::CacheExhausted {
                requested: prompt_blocks,
                available: self.blocks.available(),
            }
            .into());
        }

        let mut sequences = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let mut seq = SequenceState::new(prompt.clone());
            if max_generation_steps == 0 {
                seq.finish(FinishReason::Length);
            } else {
                let mut table = BlockTable::new(self.block_size);
                match Self::grow(&mut table, &mut self.blocks, prompt.len()) {
                    Ok(()) => seq.cache = CacheBinding::Paged(table),
                    Err(err) => {
                        for earlier in &mut sequences {
                            self.free_binding(earlier);
                        }
                        return Err(err.into());
                    }
                }
            }
            sequences.push(seq);
        }

        if let Err(err) = self.prefill_forward(&mut sequences, params, max_generation_steps) {
            // A failed batch must not keep its blocks.
            for seq in &mut sequences {
                self.free_binding(seq);
            }
            return Err(err);
        }

        debug!(
            sequences = sequences.len(),
            free_blocks = self.blocks.available(),
            "prefill complete"
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
            let last = *seq
                .generated_token_ids
                .last()
                .ok_or_else(|| BackendError::InvalidState("decode before prefill".to_string()))?;
            let position = seq.prompt_token_ids.len() + seq.generated_token_ids.len() - 1;

            let CacheBinding::Paged(table) = &mut seq.cache else {
                return Err(BackendError::InvalidState(
                    "active sequence has no cache".to_string(),
                ));
            };
            match Self::grow(table, &mut self.blocks, 1) {
                Ok(()) => {}
                Err(CacheError::CacheExhausted { .. }) => {
                    seq.finish(FinishReason::Capacity);
                    self.free_binding(seq);
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            let mut slot = PagedSlot::new(&mut self.cache, table);
            let logits = model.forward(&[last], &[position], &mut slot)?;
            let (token, logprob) =
                sampling::choose_with_logprob(&logits, &session.params, i, seq.next_step())?;
            seq.accept(token, logprob, eos, session.max_generation_steps);
            if seq.status.is_terminal() {
                self.free_binding(seq);
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
        self.free_binding(seq);
        Ok(())
    }
}
