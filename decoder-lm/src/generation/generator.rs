//! Autoregressive text generation.

use candle_core::{Device, IndexOp, Tensor};
use rand_core::SeedableRng;
use rand_pcg::Pcg32;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::architectures::CausalLM;
use crate::error::BoxedError;
use crate::generation::sampler::{Sampler, SamplerError};
use crate::tokenizers::tokenizer::{Tokenizer, TokenizerEncodeInput};

/// Errors for text generation.
#[derive(Debug, Snafu)]
pub enum GenerationError {
    #[snafu(display("Cannot create context tensor"))]
    ContextTensor { source: candle_core::Error },

    #[snafu(display("Cannot decode generated pieces"))]
    Decode { source: BoxedError },

    #[snafu(display("Prompt does not contain any pieces"))]
    EmptyPrompt,

    #[snafu(display("Cannot encode prompt"))]
    Encode { source: BoxedError },

    #[snafu(display("Cannot apply model"))]
    Forward { source: BoxedError },

    #[snafu(display("Cannot select logits of the last piece"))]
    LastLogits { source: candle_core::Error },

    #[snafu(display("Cannot sample next piece"))]
    Sample { source: SamplerError },
}

/// Generation configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationConfig {
    max_new_tokens: usize,
    sampler: Sampler,
    seed: u64,
    stop_at_eos: bool,
}

impl GenerationConfig {
    /// Maximum number of pieces to generate.
    ///
    /// Default: `50`
    pub fn max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Sampler that picks the next piece.
    ///
    /// Default: `Sampler::Greedy`
    pub fn sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Seed of the sampler's random number generator.
    ///
    /// Default: `42`
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Stop when the tokenizer's end-of-sequence piece is generated.
    ///
    /// Default: `true`
    pub fn stop_at_eos(mut self, stop_at_eos: bool) -> Self {
        self.stop_at_eos = stop_at_eos;
        self
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 50,
            sampler: Sampler::Greedy,
            seed: 42,
            stop_at_eos: true,
        }
    }
}

/// Why generation stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FinishReason {
    /// The end-of-sequence piece was generated.
    Eos,

    /// The maximum number of new pieces was generated.
    MaxNewTokens,
}

/// Generated continuation of a prompt.
#[derive(Clone, Debug, PartialEq)]
pub struct Generated {
    /// Why generation stopped.
    pub finish_reason: FinishReason,

    /// Generated piece identifiers, without the end-of-sequence piece.
    pub piece_ids: Vec<u32>,

    /// Decoded continuation.
    pub text: String,
}

/// Generator that continues prompts with a causal language model.
///
/// Every step runs the model on the running sequence and appends one
/// piece. When the sequence is longer than the model's maximum sequence
/// length, only the most recent pieces are used as context.
pub struct Generator<M, T> {
    device: Device,
    model: M,
    tokenizer: T,
}

impl<M, T> Generator<M, T>
where
    M: CausalLM,
    T: Tokenizer,
{
    /// Create a generator.
    ///
    /// * `model` - The language model.
    /// * `tokenizer` - Tokenizer with the model's vocabulary.
    /// * `device` - Device of the model parameters.
    pub fn new(model: M, tokenizer: T, device: &Device) -> Self {
        Generator {
            device: device.clone(),
            model,
            tokenizer,
        }
    }

    /// The language model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// The tokenizer.
    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    /// Continue a text prompt.
    ///
    /// * `prompt` - Text to continue.
    /// * `config` - Generation configuration.
    pub fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<Generated, GenerationError> {
        let encoded = self
            .tokenizer
            .encode([TokenizerEncodeInput::RawString(prompt)])
            .context(EncodeSnafu)?;
        let prompt_ids = encoded.ids.into_iter().next().context(EmptyPromptSnafu)?;

        let (piece_ids, finish_reason) = self.generate_ids(&prompt_ids, config)?;
        let text = self
            .tokenizer
            .decode([&piece_ids], true)
            .context(DecodeSnafu)?
            .into_iter()
            .next()
            .unwrap_or_default();

        Ok(Generated {
            finish_reason,
            piece_ids,
            text,
        })
    }

    /// Continue a prompt of piece identifiers.
    ///
    /// * `prompt_ids` - Piece identifiers of the prompt.
    /// * `config` - Generation configuration.
    ///
    /// Returns: The generated piece identifiers, excluding the prompt and
    /// the end-of-sequence piece, and the reason why generation stopped.
    pub fn generate_ids(
        &self,
        prompt_ids: &[u32],
        config: &GenerationConfig,
    ) -> Result<(Vec<u32>, FinishReason), GenerationError> {
        ensure!(!prompt_ids.is_empty(), EmptyPromptSnafu);

        let eos_id = if config.stop_at_eos {
            self.tokenizer.eos_piece_id()
        } else {
            None
        };
        let max_seq_len = self.model.max_seq_len();
        let mut rng = Pcg32::seed_from_u64(config.seed);

        let mut sequence = prompt_ids.to_vec();
        let mut generated = Vec::with_capacity(config.max_new_tokens);
        while generated.len() < config.max_new_tokens {
            let context_start = sequence.len().saturating_sub(max_seq_len);
            let context = &sequence[context_start..];
            let next_id = self.next_piece(context, &config.sampler, &mut rng)?;

            if Some(next_id) == eos_id {
                tracing::debug!(n_generated = generated.len(), "generated end-of-sequence piece");
                return Ok((generated, FinishReason::Eos));
            }

            sequence.push(next_id);
            generated.push(next_id);
        }

        tracing::debug!(n_generated = generated.len(), "reached maximum number of new pieces");
        Ok((generated, FinishReason::MaxNewTokens))
    }

    fn next_piece(
        &self,
        context: &[u32],
        sampler: &Sampler,
        rng: &mut Pcg32,
    ) -> Result<u32, GenerationError> {
        let context_ids = Tensor::new(context, &self.device)
            .and_then(|ids| ids.unsqueeze(0))
            .context(ContextTensorSnafu)?;

        let output = self
            .model
            .forward_t(&context_ids, false)
            .context(ForwardSnafu)?;

        let last_logits = output
            .logits()
            .i((0, context.len() - 1))
            .context(LastLogitsSnafu)?;

        sampler.sample(&last_logits, rng).context(SampleSnafu)
    }
}
