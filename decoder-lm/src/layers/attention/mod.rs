use candle_core::Tensor;
use candle_nn::VarBuilder;

mod sdpa;
pub use sdpa::{ScaledDotProductAttention, ScaledDotProductAttentionError};

mod self_attention;
pub use self_attention::{SelfAttention, SelfAttentionConfig, SelfAttentionError};

use crate::error::BoxedError;

/// Trait for attention modules.
pub trait Attention {
    /// Apply attention to the given input.
    ///
    /// * `input` - Input tensor.
    ///   *Shape:* `(batch_size, seq_len, width)`
    /// * `train` - Whether the model is trained.
    ///
    /// Returns: Hidden representations after attention and the attention
    /// weights of every head.
    /// *Shapes:* `(batch_size, seq_len, width)`,
    /// `(batch_size, n_heads, seq_len, seq_len)`
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<(Tensor, Tensor), BoxedError>;
}

/// Build an attention module.
pub trait BuildAttention: std::fmt::Debug {
    /// Build an attention module.
    ///
    /// * `vb` - Variable builder used for attention parameters.
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn Attention>, BoxedError>;
}
