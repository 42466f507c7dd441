use candle_core::{DType, Tensor, D};
use candle_nn::ops::softmax;
use snafu::{ResultExt, Snafu};

use crate::util::tensor_ext::MinLike;

/// Errors for scaled dot-product attention.
#[derive(Debug, Snafu)]
pub enum ScaledDotProductAttentionError {
    #[snafu(display("Cannot calculate attention scores"))]
    AttentionScores { source: candle_core::Error },

    #[snafu(display("Cannot weigh representations using attention weights"))]
    AttentionWeight { source: candle_core::Error },

    #[snafu(display("Cannot apply causal mask"))]
    CausalMask { source: candle_core::Error },

    #[snafu(display("Cannot apply softmax temperature"))]
    Temperature { source: candle_core::Error },
}

/// Scaled dot-product attention.
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762).
#[derive(Clone, Debug, Default)]
pub struct ScaledDotProductAttention;

impl ScaledDotProductAttention {
    /// Apply attention scores to the given key, query and value.
    ///
    /// * `query` - Query tensor.
    ///   *Shape:* `(batch_size, heads, seq_len, width)`
    /// * `key` - Key tensor.
    ///   *Shape:* `(batch_size, heads, seq_len, width)`
    /// * `value` - Value tensor.
    ///   *Shape:* `(batch_size, heads, seq_len, width)`
    /// * `use_causal_mask` - Whether to apply a causal mask. With a causal mask,
    ///   a sequence element can only attend to preceding elements and itself.
    ///
    /// Returns: Attention values and attention weights.
    /// *Shapes:* `(batch_size, heads, seq_len, width)`,
    /// `(batch_size, heads, seq_len, seq_len)`
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        use_causal_mask: bool,
    ) -> Result<(Tensor, Tensor), ScaledDotProductAttentionError> {
        // Calculate attention scores.
        let query = query.contiguous().context(AttentionScoresSnafu)?;
        let mut attn_scores = key
            .contiguous()
            .and_then(|key| key.transpose(3, 2))
            .and_then(|key| query.broadcast_matmul(&key))
            .context(AttentionScoresSnafu)?;

        let head_width = key.dim(3).context(TemperatureSnafu)?;
        let temperature = (head_width as f64).sqrt();
        attn_scores = (attn_scores / temperature).context(TemperatureSnafu)?;

        if use_causal_mask {
            attn_scores = Self::apply_causal_mask(&attn_scores).context(CausalMaskSnafu)?;
        }

        // Softmax subtracts the row maximum before exponentiation.
        let attn_weights = softmax(&attn_scores, D::Minus1).context(AttentionWeightSnafu)?;
        let attn_values = value
            .contiguous()
            .and_then(|value| attn_weights.broadcast_matmul(&value))
            .context(AttentionWeightSnafu)?;

        Ok((attn_values, attn_weights))
    }

    /// Mask out scores of keys that succeed the query.
    fn apply_causal_mask(attn_scores: &Tensor) -> Result<Tensor, candle_core::Error> {
        let (_, _, query_len, key_len) = attn_scores.dims4()?;
        Tensor::tril2(key_len, DType::U8, attn_scores.device())?
            .narrow(0, key_len - query_len, query_len)?
            .broadcast_as(attn_scores.shape())?
            .where_cond(attn_scores, &attn_scores.min_like()?)
    }
}
