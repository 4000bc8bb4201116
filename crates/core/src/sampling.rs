//! Token selection policy shared by both backends.
//!
//! Sampling is a pure function of `(logits, params, sequence_index, step)`.
//! The stochastic path derives a fresh RNG per call from those inputs, so the
//! token drawn for a sequence never depends on batch composition or on which
//! backend produced the logits.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("invalid sampling parameter {name}={value}: {reason}")]
    InvalidSamplingParameter {
        name: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("logit vector is empty")]
    EmptyLogits,
}

/// Per-request sampling controls. `temperature == 0.0` selects greedy
/// decoding and makes `top_k`/`top_p` irrelevant.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            top_p: None,
            seed: 0,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<(), SamplingError> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SamplingError::InvalidSamplingParameter {
                name: "temperature",
                value: self.temperature.to_string(),
                reason: "must be finite and non-negative",
            });
        }
        if let Some(k) = self.top_k {
            if k < 1 {
                return Err(SamplingError::InvalidSamplingParameter {
                    name: "top_k",
                    value: k.to_string(),
                    reason: "must be at least 1",
                });
            }
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(SamplingError::InvalidSamplingParameter {
                    name: "top_p",
                    value: p.to_string(),
                    reason: "must be in (0, 1]",
                });
            }
        }
        Ok(())
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Derive the RNG seed for one `(request seed, sequence, step)` triple.
pub fn stream_seed(seed: u64, sequence_index: usize, step: usize) -> u64 {
    let mut s = splitmix64(seed);
    s = splitmix64(s ^ (sequence_index as u64).wrapping_mul(0xd6e8_feb8_6659_fd93));
    splitmix64(s ^ (step as u64).wrapping_mul(0xa24b_aed4_963e_e407))
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum: f32 = logits
        .iter()
        .map(|&l| ((l - max) as f64).exp())
        .sum::<f64>()
        .ln() as f32;
    logits.iter().map(|&l| l - max - log_sum).collect()
}

fn softmax_scaled(logits: &[f32], temperature: f32) -> Vec<f64> {
    let inv = 1.0 / temperature as f64;
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let exps: Vec<f64> = logits
        .iter()
        .map(|&l| ((l as f64 - max) * inv).exp())
        .collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    for (i, &l) in logits.iter().enumerate().skip(1) {
        // Strict '>' keeps the lowest index on exact ties.
        if l > logits[best] {
            best = i;
        }
    }
    best as u32
}

/// Token ids sorted by descending probability, lowest id first on ties.
fn by_probability(probs: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    order
}

/// Select the next token for one sequence.
///
/// Greedy when `temperature == 0.0`; otherwise temperature-scaled softmax
/// restricted to the intersection of the top-k and nucleus sets, renormalized
/// and sampled with a per-`(seed, sequence, step)` RNG. The returned logprob
/// is taken from the unscaled model distribution either way.
pub fn choose_with_logprob(
    logits: &[f32],
    params: &SamplingParams,
    sequence_index: usize,
    step: usize,
) -> Result<(u32, f32), SamplingError> {
    if logits.is_empty() {
        return Err(SamplingError::EmptyLogits);
    }
    let token = if params.is_greedy() {
        argmax(logits)
    } else {
        sample(logits, params, sequence_index, step)
    };
    let logprob = log_softmax(logits)[token as usize];
    Ok((token, logprob))
}

pub fn choose(
    logits: &[f32],
    params: &SamplingParams,
    sequence_index: usize,
    step: usize,
) -> Result<u32, SamplingError> {
    choose_with_logprob(logits, params, sequence_index, step).map(|(t, _)| t)
}

fn sample(logits: &[f32], params: &SamplingParams, sequence_index: usize, step: usize) -> u32 {
    let probs = softmax_scaled(logits, params.temperature);
    let order = by_probability(&probs);

    let mut allowed = vec![true; probs.len()];
    if let Some(k) = params.top_k {
        if k < probs.len() {
            for &i in &order[k..] {
                allowed[i] = false;
            }
        }
    }
    if let Some(p) = params.top_p {
        let p = p as f64;
        let mut cumulative = 0.0;
        let mut nucleus_done = false;
        for &i in &order {
            if nucleus_done {
                allowed[i] = false;
            } else {
                cumulative += probs[i];
                if cumulative >= p {
                    nucleus_done = true;
                }
            }
        }
    }

    let total: f64 = probs
        .iter()
        .zip(&allowed)
        .filter(|(_, &a)| a)
        .map(|(&p, _)| p)
        .sum();

    let mut rng = StdRng::seed_from_u64(stream_seed(params.seed, sequence_index, step));
    let target = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    let mut last_allowed = 0u32;
    for (i, (&p, &a)) in probs.iter().zip(&allowed).enumerate() {
        if !a {
            continue;
        }
        cumulative += p;
        last_allowed = i as u32;
        if cumulative >= target {
            return last_allowed;
        }
    }
    // Rounding can leave the target marginally past the final mass.
    last_allowed
}
