/// Transformer building blocks.
use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::architectures::{BuildDecoderLayer, DecoderLayer};
use crate::error::BoxedError;
use crate::layers::attention::{Attention, BuildAttention, SelfAttentionConfig};
use crate::layers::build_module::BuildModule;
use crate::layers::dropout::DropoutConfig;
use crate::layers::feedforward::PointwiseFeedForwardConfig;
use crate::layers::identity::Identity;
use crate::layers::layer_norm::LayerNormConfig;

/// Layer normalizations used in a transformer layer.
///
/// By default, all the normalizations are disabled by setting the layer
/// normalization to the `Identity` module. Therefore, only normalizations
/// that are needed have to be set.
pub struct TransformerLayerNorms {
    /// Normalization of the output to the attention layer after the residual
    /// connection.
    pub attn_residual_layer_norm: Box<dyn ModuleT>,

    /// Normalization of the output of the feed-forward layer after the
    /// residual connection.
    pub ffn_residual_layer_norm: Box<dyn ModuleT>,
}

impl Default for TransformerLayerNorms {
    fn default() -> Self {
        TransformerLayerNorms {
            attn_residual_layer_norm: Box::new(Identity),
            ffn_residual_layer_norm: Box::new(Identity),
        }
    }
}

/// Dropouts used in a transformer layer.
///
/// By default, all the dropouts are disabled by setting the dropout
/// to the `Identity` module. Therefore, only dropouts that are
/// needed have to be set.
pub struct TransformerDropouts {
    /// Dropout of the attention output, before the residual connection.
    pub attn_output_dropout: Box<dyn ModuleT>,

    /// Dropout of the feed-forward output, before the residual connection.
    pub ffn_output_dropout: Box<dyn ModuleT>,
}

impl Default for TransformerDropouts {
    fn default() -> Self {
        TransformerDropouts {
            attn_output_dropout: Box::new(Identity),
            ffn_output_dropout: Box::new(Identity),
        }
    }
}

/// Transformer layer configuration.
#[derive(Debug)]
pub struct TransformerLayerConfig {
    attention: Box<dyn BuildAttention>,
    dropout: Box<dyn BuildModule>,
    feedforward: Box<dyn BuildModule>,
    layer_norm: Box<dyn BuildModule>,
}

impl TransformerLayerConfig {
    /// Attention layer.
    ///
    /// Default: `SelfAttentionConfig::default()`
    pub fn attention(mut self, attention: Box<dyn BuildAttention>) -> Self {
        self.attention = attention;
        self
    }

    /// Dropout applied to the attention and feed-forward outputs.
    ///
    /// Default: `DropoutConfig::default()`
    pub fn dropout(mut self, dropout: Box<dyn BuildModule>) -> Self {
        self.dropout = dropout;
        self
    }

    /// Feed-forward layer.
    ///
    /// Default: `PointwiseFeedForwardConfig::default()`
    pub fn feedforward(mut self, feedforward: Box<dyn BuildModule>) -> Self {
        self.feedforward = feedforward;
        self
    }

    /// Layer norm applied after each residual connection.
    ///
    /// Default: `LayerNormConfig::default()`
    pub fn layer_norm(mut self, layer_norm: Box<dyn BuildModule>) -> Self {
        self.layer_norm = layer_norm;
        self
    }

    /// Build a transformer layer.
    pub fn build(&self, vb: VarBuilder) -> Result<TransformerLayer, TransformerLayerError> {
        let attention = self
            .attention
            .build(vb.push_prefix("mha"))
            .context(BuildAttentionSnafu)?;

        let feedforward = self
            .feedforward
            .build(vb.push_prefix("ffn"))
            .context(BuildFeedForwardSnafu)?;

        let dropouts = TransformerDropouts {
            attn_output_dropout: self
                .dropout
                .build(vb.push_prefix("attn_output_dropout"))
                .context(BuildDropoutSnafu)?,
            ffn_output_dropout: self
                .dropout
                .build(vb.push_prefix("ffn_output_dropout"))
                .context(BuildDropoutSnafu)?,
        };

        let norms = TransformerLayerNorms {
            attn_residual_layer_norm: self
                .layer_norm
                .build(vb.push_prefix("attn_residual_layer_norm"))
                .context(BuildLayerNormSnafu)?,
            ffn_residual_layer_norm: self
                .layer_norm
                .build(vb.push_prefix("ffn_residual_layer_norm"))
                .context(BuildLayerNormSnafu)?,
        };

        Ok(TransformerLayer::new(attention, dropouts, feedforward, norms))
    }
}

impl Default for TransformerLayerConfig {
    fn default() -> Self {
        Self {
            attention: Box::<SelfAttentionConfig>::default(),
            dropout: Box::<DropoutConfig>::default(),
            feedforward: Box::<PointwiseFeedForwardConfig>::default(),
            layer_norm: Box::<LayerNormConfig>::default(),
        }
    }
}

impl BuildDecoderLayer for TransformerLayerConfig {
    fn build_decoder_layer(&self, vb: VarBuilder) -> Result<Box<dyn DecoderLayer>, BoxedError> {
        Ok(Box::new(self.build(vb)?))
    }
}

/// Errors for transformer layers.
#[derive(Debug, Snafu)]
pub enum TransformerLayerError {
    #[snafu(display("Cannot build attention layer"))]
    BuildAttention { source: BoxedError },

    #[snafu(display("Cannot build dropout"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot build feed-forward layer"))]
    BuildFeedForward { source: BoxedError },

    #[snafu(display("Cannot build layer norm"))]
    BuildLayerNorm { source: BoxedError },

    #[snafu(display("Cannot apply point-wise feed-forward layer"))]
    FeedForward { source: candle_core::Error },

    #[snafu(display("Cannot apply residual connection"))]
    Residual { source: candle_core::Error },

    #[snafu(display("Cannot apply self-attention"))]
    SelfAttention { source: BoxedError },
}

/// Post-norm transformer layer.
///
/// Each sublayer output passes through dropout, is added to the sublayer
/// input and is then normalized:
///
/// * `x1 = norm_1(x + dropout(attention(x)))`
/// * `x2 = norm_2(x1 + dropout(ffn(x1)))`
///
/// See [Vaswani et al. (2017)](https://arxiv.org/abs/1706.03762).
pub struct TransformerLayer {
    dropouts: TransformerDropouts,
    ffn: Box<dyn ModuleT>,
    mha: Box<dyn Attention>,
    norms: TransformerLayerNorms,
}

impl TransformerLayer {
    /// Construct a transformer layer from its parts.
    ///
    /// * `attention_layer` - The attention layer to use in the transformer
    ///   layer.
    /// * `dropouts` - The dropouts to use in the transformer layer.
    /// * `feed_forward_layer` - The feed-forward layer to use in the
    ///   transformer layer.
    /// * `layer_norms` - The layer norms to use in the transformer layer.
    pub fn new(
        attention_layer: Box<dyn Attention>,
        dropouts: TransformerDropouts,
        feed_forward_layer: Box<dyn ModuleT>,
        layer_norms: TransformerLayerNorms,
    ) -> Self {
        Self {
            dropouts,
            ffn: feed_forward_layer,
            mha: attention_layer,
            norms: layer_norms,
        }
    }

    /// Apply the transformer layer to the given piece hidden representations.
    ///
    /// * `input` - Hidden representations to apply the layer to.
    ///   *Shape:* `(batch_size, seq_len, width)`
    /// * `train` - Whether to train the layer.
    ///
    /// Returns layer output and the attention weights.
    /// *Shapes:* `(batch_size, seq_len, width)`,
    /// `(batch_size, n_heads, seq_len, seq_len)`
    pub fn forward(
        &self,
        input: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor), TransformerLayerError> {
        let (attn_out, attn_weights) = self
            .mha
            .forward_t(input, train)
            .context(SelfAttentionSnafu)?;

        let residual = self
            .dropouts
            .attn_output_dropout
            .forward_t(&attn_out, train)
            .and_then(|xs| input + xs)
            .and_then(|xs| self.norms.attn_residual_layer_norm.forward_t(&xs, train))
            .context(ResidualSnafu)?;

        let ffn_out = self
            .ffn
            .forward_t(&residual, train)
            .context(FeedForwardSnafu)?;

        let output = self
            .dropouts
            .ffn_output_dropout
            .forward_t(&ffn_out, train)
            .and_then(|xs| residual + xs)
            .and_then(|xs| self.norms.ffn_residual_layer_norm.forward_t(&xs, train))
            .context(ResidualSnafu)?;

        Ok((output, attn_weights))
    }
}

impl DecoderLayer for TransformerLayer {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<(Tensor, Tensor), BoxedError> {
        Ok(self.forward(input, train)?)
    }
}
