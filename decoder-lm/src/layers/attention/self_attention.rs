use candle_core::{Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::attention::{
    Attention, BuildAttention, ScaledDotProductAttention, ScaledDotProductAttentionError,
};

/// Self-attention configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelfAttentionConfig {
    causal: bool,
    hidden_width: usize,
    n_heads: usize,
}

impl SelfAttentionConfig {
    /// Mask out succeeding sequence elements.
    ///
    /// Default: `false`
    pub fn causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    /// Hidden width, the width of the input and output.
    ///
    /// Default: `64`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Number of attention heads.
    ///
    /// Must evenly divide the hidden width.
    ///
    /// Default: `4`
    pub fn n_heads(mut self, n_heads: usize) -> Self {
        self.n_heads = n_heads;
        self
    }
}

impl Default for SelfAttentionConfig {
    fn default() -> Self {
        Self {
            causal: false,
            hidden_width: 64,
            n_heads: 4,
        }
    }
}

impl BuildAttention for SelfAttentionConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn Attention>, BoxedError> {
        Ok(Box::new(SelfAttention::new(vb, self)?))
    }
}

/// Errors for self-attention.
#[derive(Debug, Snafu)]
pub enum SelfAttentionError {
    #[snafu(display("Cannot apply scaled dot-product attention"))]
    AttentionScorer {
        source: ScaledDotProductAttentionError,
    },

    #[snafu(display("Cannot combine heads"))]
    CombineHeads { source: candle_core::Error },

    #[snafu(display(
        "Hidden width {hidden_width} is not divisible by the number of heads {n_heads}"
    ))]
    IndivisibleHeads { hidden_width: usize, n_heads: usize },

    #[snafu(display("Cannot apply output layer"))]
    Output { source: candle_core::Error },

    #[snafu(display("Cannot calculate key, query, or value"))]
    Qkv { source: candle_core::Error },

    #[snafu(display("Cannot construct layer"))]
    SelfAttentionConstruction { source: candle_core::Error },

    #[snafu(display("Cannot split heads"))]
    SplitHeads { source: candle_core::Error },
}

/// Transformer multi-head self-attention layer.
///
/// The input is projected to queries, keys and values, which are split
/// into `n_heads` heads of width `hidden_width / n_heads`. Each head is
/// attended independently, then the heads are concatenated in order and
/// projected back to the hidden width.
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762).
pub struct SelfAttention {
    attention_scorer: ScaledDotProductAttention,
    causal: bool,
    key: Linear,
    n_heads: usize,
    output: Linear,
    query: Linear,
    value: Linear,
}

impl SelfAttention {
    /// Construct a self-attention layer.
    ///
    /// * `vb` - Variable store.
    /// * `config` - Self-attention configuration.
    pub fn new(vb: VarBuilder, config: &SelfAttentionConfig) -> Result<Self, SelfAttentionError> {
        let SelfAttentionConfig {
            causal,
            hidden_width,
            n_heads,
        } = *config;

        ensure!(
            n_heads > 0 && hidden_width % n_heads == 0,
            IndivisibleHeadsSnafu {
                hidden_width,
                n_heads
            }
        );

        let projection = |name: &str| {
            linear(hidden_width, hidden_width, vb.push_prefix(name))
                .context(SelfAttentionConstructionSnafu)
        };

        Ok(Self {
            attention_scorer: ScaledDotProductAttention,
            causal,
            key: projection("key")?,
            n_heads,
            output: projection("output")?,
            query: projection("query")?,
            value: projection("value")?,
        })
    }

    /// Apply self-attention.
    ///
    /// * `input` - Input tensor.
    ///   *Shape:* `(batch_size, seq_len, width)`
    ///
    /// Returns: Attention output and attention weights.
    /// *Shapes:* `(batch_size, seq_len, width)`,
    /// `(batch_size, n_heads, seq_len, seq_len)`
    pub fn forward(&self, input: &Tensor) -> Result<(Tensor, Tensor), SelfAttentionError> {
        let query = self
            .query
            .forward(input)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)?;
        let key = self
            .key
            .forward(input)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)?;
        let value = self
            .value
            .forward(input)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)?;

        let (attn, attn_weights) = self
            .attention_scorer
            .forward(&query, &key, &value, self.causal)
            .context(AttentionScorerSnafu)?;

        let output = self
            .output
            .forward(&attn.combine_heads()?)
            .context(OutputSnafu)?;

        Ok((output, attn_weights))
    }
}

impl Attention for SelfAttention {
    fn forward_t(&self, input: &Tensor, _train: bool) -> Result<(Tensor, Tensor), BoxedError> {
        Ok(self.forward(input)?)
    }
}

trait CombineHeads {
    fn combine_heads(&self) -> Result<Tensor, SelfAttentionError>;
}

impl CombineHeads for Tensor {
    fn combine_heads(&self) -> Result<Tensor, SelfAttentionError> {
        let (batch_size, n_heads, seq_len, head_width) =
            self.dims4().context(CombineHeadsSnafu)?;
        self.transpose(1, 2)
            .and_then(|heads| heads.reshape((batch_size, seq_len, n_heads * head_width)))
            .context(CombineHeadsSnafu)
    }
}

trait SplitHeads {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, SelfAttentionError>;
}

impl SplitHeads for Tensor {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, SelfAttentionError> {
        let (batch_size, seq_len, model_width) = self.dims3().context(SplitHeadsSnafu)?;
        let head_width = model_width / n_heads;
        self.reshape((batch_size, seq_len, n_heads, head_width))
            .and_then(|heads| heads.transpose(1, 2))
            .context(SplitHeadsSnafu)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor, D};
    use rstest::rstest;
    use snafu::{report, ResultExt, Whatever};

    use super::{CombineHeads, SelfAttention, SelfAttentionConfig, SelfAttentionError, SplitHeads};
    use crate::util::device::tests::test_devices;
    use crate::util::tests::{assert_tensor_eq, PseudoRandom, SeededVars};

    #[rstest]
    #[case(64, 4)]
    #[case(64, 1)]
    #[case(12, 3)]
    #[case(8, 8)]
    fn self_attention_accepts_divisible_heads(#[case] hidden_width: usize, #[case] n_heads: usize) {
        let vars = SeededVars::new(&Device::Cpu);
        let config = SelfAttentionConfig::default()
            .hidden_width(hidden_width)
            .n_heads(n_heads);
        assert!(SelfAttention::new(vars.vb(), &config).is_ok());
    }

    #[rstest]
    #[case(10, 3)]
    #[case(64, 5)]
    #[case(64, 0)]
    fn self_attention_rejects_indivisible_heads(
        #[case] hidden_width: usize,
        #[case] n_heads: usize,
    ) {
        let vars = SeededVars::new(&Device::Cpu);
        let config = SelfAttentionConfig::default()
            .hidden_width(hidden_width)
            .n_heads(n_heads);
        assert!(matches!(
            SelfAttention::new(vars.vb(), &config),
            Err(SelfAttentionError::IndivisibleHeads { .. })
        ));
    }

    #[test]
    #[report]
    fn self_attention_output_shapes() -> Result<(), Whatever> {
        for device in test_devices() {
            let vars = SeededVars::new(&device);
            let attention = SelfAttention::new(
                vars.vb(),
                &SelfAttentionConfig::default().hidden_width(16).n_heads(4),
            )
            .whatever_context("Cannot construct attention")?;
            vars.init(1)?;

            let input = Tensor::pseudo_random(&[2, 7, 16], &device);
            let (output, weights) = attention
                .forward(&input)
                .whatever_context("Cannot apply attention")?;

            assert_eq!(output.dims(), &[2, 7, 16]);
            assert_eq!(weights.dims(), &[2, 4, 7, 7]);

            let sums = weights
                .sum(D::Minus1)
                .whatever_context("Cannot sum weights")?;
            assert_tensor_eq!(
                &sums,
                sums.ones_like().whatever_context("Cannot create ones")?,
                epsilon = 1e-5f32,
            );
        }

        Ok(())
    }

    fn seeded_attention(
        causal: bool,
        device: &Device,
    ) -> Result<(SeededVars, SelfAttention), Whatever> {
        let vars = SeededVars::new(device);
        let attention = SelfAttention::new(
            vars.vb(),
            &SelfAttentionConfig::default()
                .causal(causal)
                .hidden_width(16)
                .n_heads(4),
        )
        .whatever_context("Cannot construct attention")?;
        vars.init(7)?;
        Ok((vars, attention))
    }

    #[test]
    #[report]
    fn self_attention_permutes_with_its_input() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let (_vars, attention) = seeded_attention(false, &device)?;
        let input = Tensor::pseudo_random(&[1, 5, 16], &device);
        let permutation = Tensor::new(&[3u32, 0, 4, 1, 2], &device)
            .whatever_context("Cannot create permutation")?;

        let (output, _) = attention
            .forward(&input)
            .whatever_context("Cannot apply attention")?;
        let (permuted_output, _) = input
            .index_select(&permutation, 1)
            .whatever_context("Cannot permute input")
            .and_then(|permuted| {
                attention
                    .forward(&permuted)
                    .whatever_context("Cannot apply attention")
            })?;

        assert_tensor_eq!(
            permuted_output,
            output
                .index_select(&permutation, 1)
                .whatever_context("Cannot permute output")?,
            epsilon = 1e-5f32,
        );

        Ok(())
    }

    #[test]
    #[report]
    fn self_attention_mixes_positions() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let (_vars, attention) = seeded_attention(false, &device)?;
        let input = Tensor::pseudo_random(&[1, 5, 16], &device);
        let changed = Tensor::cat(
            &[
                input.narrow(1, 0, 4).whatever_context("Cannot slice input")?,
                Tensor::pseudo_random(&[1, 1, 16], &device),
            ],
            1,
        )
        .whatever_context("Cannot replace last position")?;

        let (output, _) = attention
            .forward(&input)
            .whatever_context("Cannot apply attention")?;
        let (changed_output, _) = attention
            .forward(&changed)
            .whatever_context("Cannot apply attention")?;

        // The first position sees the changed last position.
        let first = output.narrow(1, 0, 1).whatever_context("Cannot slice output")?;
        let changed_first = changed_output
            .narrow(1, 0, 1)
            .whatever_context("Cannot slice output")?;
        let difference = (first - changed_first)
            .and_then(|diff| diff.abs())
            .and_then(|diff| diff.flatten_all())
            .and_then(|diff| diff.max(0))
            .and_then(|diff| diff.to_scalar::<f32>())
            .whatever_context("Cannot compare outputs")?;
        assert!(difference > 1e-6);

        Ok(())
    }

    #[test]
    #[report]
    fn causal_self_attention_ignores_succeeding_positions() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let (_vars, attention) = seeded_attention(true, &device)?;
        let input = Tensor::pseudo_random(&[1, 5, 16], &device);

        let (output, weights) = attention
            .forward(&input)
            .whatever_context("Cannot apply attention")?;

        let weights = weights
            .get(0)
            .and_then(|weights| weights.to_vec3::<f32>())
            .whatever_context("Cannot read weights")?;
        for head in weights {
            for (query, row) in head.into_iter().enumerate() {
                assert!(row[query + 1..].iter().all(|&weight| weight == 0.));
            }
        }

        let changed = Tensor::cat(
            &[
                input.narrow(1, 0, 4).whatever_context("Cannot slice input")?,
                Tensor::pseudo_random(&[1, 1, 16], &device),
            ],
            1,
        )
        .whatever_context("Cannot replace last position")?;
        let (changed_output, _) = attention
            .forward(&changed)
            .whatever_context("Cannot apply attention")?;
        assert_tensor_eq!(
            changed_output
                .narrow(1, 0, 4)
                .whatever_context("Cannot slice output")?,
            output.narrow(1, 0, 4).whatever_context("Cannot slice output")?,
            epsilon = 1e-6f32,
        );

        Ok(())
    }

    #[test]
    #[report]
    fn split_and_combine_heads_are_inverse() -> Result<(), Whatever> {
        let input = Tensor::pseudo_random(&[2, 5, 12], &Device::Cpu);
        let heads = input
            .split_heads(3)
            .whatever_context("Cannot split heads")?;
        assert_eq!(heads.dims(), &[2, 3, 5, 4]);

        // Head `h` holds features `[4h, 4h + 4)` of every position.
        assert_tensor_eq!(
            heads
                .get(0)
                .and_then(|xs| xs.get(1))
                .whatever_context("Cannot index head")?,
            input
                .get(0)
                .and_then(|xs| xs.narrow(1, 4, 4))
                .whatever_context("Cannot slice input")?,
            epsilon = 0f32,
        );

        assert_tensor_eq!(
            heads
                .combine_heads()
                .whatever_context("Cannot combine heads")?,
            &input,
            epsilon = 0f32,
        );

        Ok(())
    }
}
