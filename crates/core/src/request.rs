use serde::{Deserialize, Serialize};

use crate::sampling::SamplingParams;

/// One batched generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub input_strings: Vec<String>,
    pub max_generation_steps: usize,
    /// Prompts longer than this keep their trailing tokens. Defaults to
    /// whatever leaves room for `max_generation_steps` in the cache.
    #[serde(default)]
    pub max_prompt_length: Option<usize>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub seed: u64,
    /// Prepend the prompt tokens to each output.
    #[serde(default)]
    pub echo: bool,
    /// Right-pad token rows to a common length with the pad token.
    #[serde(default)]
    pub pad_output: bool,
}

fn default_temperature() -> f32 {
    1.0
}

impl GenerationRequest {
    pub fn greedy(input_strings: Vec<String>, max_generation_steps: usize) -> Self {
        Self {
            input_strings,
            max_generation_steps,
            max_prompt_length: None,
            temperature: 0.0,
            top_k: None,
            top_p: None,
            seed: 0,
            echo: false,
            pad_output: false,
        }
    }

    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            seed: self.seed,
        }
    }
}

/// Per-sequence outputs, index-aligned with `input_strings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: Vec<String>,
    pub tokens: Vec<Vec<u32>>,
    /// Log probability of each generated token under the model distribution.
    /// Covers generated tokens only, never echoed prompt or padding.
    pub logprobs: Option<Vec<Vec<f32>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// The model produced the EOS token.
    Eos,
    /// The generation budget ran out.
    Length,
    /// The sequence's cache reservation ran out mid-decode.
    Capacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Pending,
    Prefilling,
    Decoding,
    Finished(FinishReason),
    Cancelled,
}

impl SequenceStatus {
    /// Still producing tokens.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Prefilling | Self::Decoding)
    }

    /// Terminal, whether finished or cancelled.
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self {
            Self::Finished(reason) => Some(*reason),
            _ => None,
        }
    }
}
