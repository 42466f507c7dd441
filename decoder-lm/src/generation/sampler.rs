//! Next-piece sampling.

use candle_core::{DType, Tensor};
use rand_core::RngCore;
use rand_pcg::Pcg32;
use snafu::{ensure, ResultExt, Snafu};

/// Errors for samplers.
#[derive(Debug, Snafu)]
pub enum SamplerError {
    #[snafu(display("Cannot sample from empty logits"))]
    EmptyLogits,

    #[snafu(display("Logits must have shape (n_pieces,)"))]
    InvalidLogits { source: candle_core::Error },

    #[snafu(display("Top-k sampling requires k > 0"))]
    InvalidTopK,

    #[snafu(display("Temperature must be positive and finite, was {temperature}"))]
    InvalidTemperature { temperature: f32 },

    #[snafu(display("Logits contain non-finite values"))]
    NonFiniteLogits,
}

/// Strategy for picking the next piece from logits.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Sampler {
    /// Pick the piece with the highest logit. Ties go to the lowest
    /// piece identifier.
    #[default]
    Greedy,

    /// Sample from the softmax distribution of `logits / temperature`.
    Temperature { temperature: f32 },

    /// Sample from the `k` highest-scoring pieces, using the softmax of
    /// `logits / temperature` over these pieces.
    TopK { k: usize, temperature: f32 },
}

impl Sampler {
    /// Pick a piece.
    ///
    /// * `logits` - Logits of the next piece.
    ///   *Shape:* `(n_pieces,)`
    /// * `rng` - Random number generator, not used by greedy sampling.
    ///
    /// Returns: The identifier of the picked piece.
    pub fn sample(&self, logits: &Tensor, rng: &mut Pcg32) -> Result<u32, SamplerError> {
        let logits = logits
            .to_dtype(DType::F32)
            .and_then(|logits| logits.to_vec1::<f32>())
            .context(InvalidLogitsSnafu)?;
        ensure!(!logits.is_empty(), EmptyLogitsSnafu);
        ensure!(logits.iter().all(|l| l.is_finite()), NonFiniteLogitsSnafu);

        match *self {
            Sampler::Greedy => Ok(argmax(&logits)),
            Sampler::Temperature { temperature } => {
                check_temperature(temperature)?;
                let candidates: Vec<_> = (0..logits.len() as u32).collect();
                Ok(sample_candidates(&logits, &candidates, temperature, rng))
            }
            Sampler::TopK { k, temperature } => {
                ensure!(k > 0, InvalidTopKSnafu);
                check_temperature(temperature)?;
                let candidates = top_k(&logits, k);
                Ok(sample_candidates(&logits, &candidates, temperature, rng))
            }
        }
    }
}

fn check_temperature(temperature: f32) -> Result<(), SamplerError> {
    ensure!(
        temperature > 0. && temperature.is_finite(),
        InvalidTemperatureSnafu { temperature }
    );
    Ok(())
}

fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    for (idx, &logit) in logits.iter().enumerate().skip(1) {
        if logit > logits[best] {
            best = idx;
        }
    }
    best as u32
}

/// Identifiers of the `k` highest logits, highest first.
fn top_k(logits: &[f32], k: usize) -> Vec<u32> {
    let mut candidates: Vec<_> = (0..logits.len() as u32).collect();
    candidates.sort_by(|&a, &b| logits[b as usize].total_cmp(&logits[a as usize]));
    candidates.truncate(k);
    candidates
}

/// Uniform number in `[0, 1)`.
fn unit_uniform(rng: &mut Pcg32) -> f32 {
    let mantissa_bits_shift = u32::BITS - f32::MANTISSA_DIGITS;
    (rng.next_u32() >> mantissa_bits_shift) as f32 / (1 << f32::MANTISSA_DIGITS) as f32
}

fn sample_candidates(logits: &[f32], candidates: &[u32], temperature: f32, rng: &mut Pcg32) -> u32 {
    // Scaled logits are at most zero.
    let max = candidates
        .iter()
        .map(|&id| logits[id as usize])
        .fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<_> = candidates
        .iter()
        .map(|&id| ((logits[id as usize] - max) / temperature).exp())
        .collect();
    let total: f32 = weights.iter().sum();

    let threshold = unit_uniform(rng) * total;
    let mut cumulative = 0.;
    for (&id, &weight) in candidates.iter().zip(&weights) {
        cumulative += weight;
        if threshold < cumulative {
            return id;
        }
    }

    // Rounding can leave the threshold just above the sum.
    candidates[candidates.len() - 1]
}
