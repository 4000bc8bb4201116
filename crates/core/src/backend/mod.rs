//! Decode backends.
//!
//! Both backends run the same loop shape: `prefill` consumes the prompts,
//! samples each sequence's first token and returns a [`DecodeSession`];
//! `decode_step` then advances every active sequence by one token until the
//! session is drained. They differ only in cache layout, vanilla reserves a
//! contiguous region per sequence while the optimized backend pages a shared
//! arena, and their sampled tokens are identical for identical inputs.

pub mod optimized;
pub mod vanilla;

use thiserror::Error;

use crate::kv_cache::{BlockTable, CacheError, CacheHandle};
use crate::model::ForwardError;
use crate::request::{FinishReason, SequenceStatus};
use crate::sampling::{SamplingError, SamplingParams};

pub use optimized::OptimizedBackend;
pub use vanilla::VanillaBackend;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Sampling(#[from] SamplingError),
    #[error(transparent)]
    Forward(#[from] ForwardError),
    #[error("invalid backend state: {0}")]
    InvalidState(String),
}

/// Where a sequence's KV history lives.
#[derive(Debug, Clone, Default)]
pub enum CacheBinding {
    #[default]
    None,
    Pooled(CacheHandle),
    Paged(BlockTable),
}

/// One sequence of a batch, from prefill to completion.
#[derive(Debug)]
pub struct SequenceState {
    pub prompt_token_ids: Vec<u32>,
    pub generated_token_ids: Vec<u32>,
    pub generated_logprobs: Vec<f32>,
    pub status: SequenceStatus,
    pub cache: CacheBinding,
}

impl SequenceState {
    pub fn new(prompt_token_ids: Vec<u32>) -> Self {
        Self {
            prompt_token_ids,
            generated_token_ids: Vec::new(),
            generated_logprobs: Vec::new(),
            status: SequenceStatus::Pending,
            cache: CacheBinding::None,
        }
    }

    /// Sampling step index for the next token of this sequence. Depends only
    /// on how many tokens the sequence itself has produced.
    pub fn next_step(&self) -> usize {
        self.generated_token_ids.len()
    }

    /// Apply one sampled token. EOS finishes the sequence without recording
    /// the token; otherwise the token is recorded and the sequence finishes
    /// with `Length` once the budget is spent.
    pub fn accept(&mut self, token: u32, logprob: f32, eos_token_id: u32, max_steps: usize) {
        if token == eos_token_id {
            self.status = SequenceStatus::Finished(FinishReason::Eos);
            return;
        }
        self.generated_token_ids.push(token);
        self.generated_logprobs.push(logprob);
        self.status = if self.generated_token_ids.len() >= max_steps {
            SequenceStatus::Finished(FinishReason::Length)
        } else {
            SequenceStatus::Decoding
        };
    }

    pub fn finish(&mut self, reason: FinishReason) {
        self.status = SequenceStatus::Finished(reason);
    }
}

/// In-flight state of one batched generation call.
#[derive(Debug)]
pub struct DecodeSession {
    pub sequences: Vec<SequenceState>,
    pub params: SamplingParams,
    pub max_generation_steps: usize,
    /// Completed `decode_step` calls.
    pub step: usize,
}

impl DecodeSession {
    pub fn new(
        sequences: Vec<SequenceState>,
        params: SamplingParams,
        max_generation_steps: usize,
    ) -> Self {
        Self {
            sequences,
            params,
            max_generation_steps,
            step: 0,
        }
    }

    pub fn all_finished(&self) -> bool {
        self.sequences.iter().all(|s| s.status.is_terminal())
    }

    pub fn active_indices(&self) -> Vec<usize> {
        self.sequences
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status.is_active())
            .map(|(i, _)| i)
            .collect()
    }
}

/// A decode engine over some cache layout.
pub trait Backend: Send {
    /// Total token capacity of the backend's cache.
    fn cache_size(&self) -> usize;

    fn eos_token_id(&self) -> u32;

    fn pad_token_id(&self) -> u32;

    /// Run the prompts through the model, sampling each sequence's first
    /// token. Fails the whole batch when it cannot be admitted at all.
    fn prefill(
        &mut self,
        prompts: &[Vec<u32>],
        params: &SamplingParams,
        max_generation_steps: usize,
    ) -> Result<DecodeSession, BackendError>;

    /// Advance every active sequence by one sampled token.
    fn decode_step(&mut self, session: &mut DecodeSession) -> Result<(), BackendError>;

    /// Stop one sequence early, releasing its cache reservation.
    fn cancel(
        &mut self,
        session: &mut DecodeSession,
        sequence_index: usize,
    ) -> Result<(), BackendError>;
}
