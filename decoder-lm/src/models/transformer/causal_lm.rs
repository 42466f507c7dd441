use candle_core::{Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::architectures::{BuildArchitecture, CausalLM, CausalLMOutput, LayerOutputs};
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::attention::SelfAttentionConfig;
use crate::layers::dropout::DropoutConfig;
use crate::layers::feedforward::PointwiseFeedForwardConfig;
use crate::layers::layer_norm::LayerNormConfig;
use crate::layers::transformer::{TransformerEmbeddingsConfig, TransformerLayerConfig};
use crate::models::transformer::{TransformerDecoder, TransformerDecoderConfig, TransformerDecoderError};

/// Transformer causal language model configuration.
///
/// The configuration is stored as `config.json` in checkpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerCausalLMConfig {
    activation: Activation,
    causal: bool,
    dropout: f32,
    hidden_width: usize,
    intermediate_width: usize,
    layer_norm_eps: f64,
    max_seq_len: usize,
    n_heads: usize,
    n_layers: usize,
    n_pieces: usize,
}

impl TransformerCausalLMConfig {
    /// Activation function of the feed-forward layers.
    ///
    /// Default: `Activation::Relu`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Mask out succeeding pieces during attention.
    ///
    /// Default: `false`
    pub fn causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    /// Dropout probability of the attention and feed-forward outputs.
    ///
    /// Default: `0.1`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Hidden width. Must be even and divisible by the number of heads.
    ///
    /// Default: `64`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Intermediate width of the feed-forward layers.
    ///
    /// Default: `256`
    pub fn intermediate_width(mut self, intermediate_width: usize) -> Self {
        self.intermediate_width = intermediate_width;
        self
    }

    /// Layer norm epsilon.
    ///
    /// Default: `1e-5`
    pub fn layer_norm_eps(mut self, layer_norm_eps: f64) -> Self {
        self.layer_norm_eps = layer_norm_eps;
        self
    }

    /// Maximum sequence length.
    ///
    /// Default: `50`
    pub fn max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = max_seq_len;
        self
    }

    /// Number of attention heads.
    ///
    /// Default: `4`
    pub fn n_heads(mut self, n_heads: usize) -> Self {
        self.n_heads = n_heads;
        self
    }

    /// Number of transformer layers.
    ///
    /// Default: `2`
    pub fn n_layers(mut self, n_layers: usize) -> Self {
        self.n_layers = n_layers;
        self
    }

    /// Number of pieces in the vocabulary.
    ///
    /// Default: `1000`
    pub fn n_pieces(mut self, n_pieces: usize) -> Self {
        self.n_pieces = n_pieces;
        self
    }

    /// Whether attention is masked to preceding pieces.
    pub fn get_causal(&self) -> bool {
        self.causal
    }

    /// Get the maximum sequence length.
    pub fn get_max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Get the number of pieces in the vocabulary.
    pub fn get_n_pieces(&self) -> usize {
        self.n_pieces
    }

    /// Decoder configuration corresponding to this model configuration.
    pub fn decoder_config(&self) -> TransformerDecoderConfig {
        let dropout = DropoutConfig::default().p(self.dropout);

        let layer = TransformerLayerConfig::default()
            .attention(Box::new(
                SelfAttentionConfig::default()
                    .causal(self.causal)
                    .hidden_width(self.hidden_width)
                    .n_heads(self.n_heads),
            ))
            .dropout(Box::new(dropout))
            .feedforward(Box::new(
                PointwiseFeedForwardConfig::default()
                    .activation(self.activation)
                    .hidden_width(self.hidden_width)
                    .intermediate_width(self.intermediate_width),
            ))
            .layer_norm(Box::new(
                LayerNormConfig::default()
                    .eps(self.layer_norm_eps)
                    .size(self.hidden_width),
            ));

        TransformerDecoderConfig::default()
            .embeddings(
                TransformerEmbeddingsConfig::default()
                    .hidden_width(self.hidden_width)
                    .max_seq_len(self.max_seq_len)
                    .n_pieces(self.n_pieces),
            )
            .layer(Box::new(layer))
            .n_hidden_layers(self.n_layers)
    }
}

impl Default for TransformerCausalLMConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Relu,
            causal: false,
            dropout: 0.1,
            hidden_width: 64,
            intermediate_width: 256,
            layer_norm_eps: 1e-5,
            max_seq_len: 50,
            n_heads: 4,
            n_layers: 2,
            n_pieces: 1000,
        }
    }
}

impl BuildArchitecture for TransformerCausalLMConfig {
    type Architecture = TransformerCausalLM;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        Ok(TransformerCausalLM::new(vb, self)?)
    }
}

/// `TransformerCausalLM` errors.
#[derive(Debug, Snafu)]
pub enum TransformerCausalLMError {
    #[snafu(display("Cannot build decoder"))]
    BuildDecoder { source: TransformerDecoderError },

    #[snafu(display("Cannot build output embeddings"))]
    BuildEmbeddings { source: candle_core::Error },

    #[snafu(display("Cannot compute logits for the output vocabulary"))]
    ComputeLogits { source: candle_core::Error },

    #[snafu(display("Cannot decode piece identifiers"))]
    Decode { source: TransformerDecoderError },

    #[snafu(display("Nothing to project, the decoder does not have any outputs"))]
    NoOutput,
}

/// Transformer-based causal language model.
///
/// Piece embeddings with sinusoidal positions are passed through a stack of
/// post-norm transformer layers. The output of the last layer is projected
/// to the vocabulary, giving unnormalized next-piece logits.
pub struct TransformerCausalLM {
    decoder: TransformerDecoder,
    output_embeddings: Linear,
}

impl TransformerCausalLM {
    /// Construct a causal language model.
    ///
    /// * `vb` - Variable store.
    /// * `config` - Model configuration.
    pub fn new(
        vb: VarBuilder,
        config: &TransformerCausalLMConfig,
    ) -> Result<Self, TransformerCausalLMError> {
        let decoder = TransformerDecoder::new(vb.push_prefix("decoder"), &config.decoder_config())
            .context(BuildDecoderSnafu)?;

        let output_embeddings = linear(
            config.hidden_width,
            config.n_pieces,
            vb.push_prefix("output_embeddings"),
        )
        .context(BuildEmbeddingsSnafu)?;

        Ok(TransformerCausalLM {
            decoder,
            output_embeddings,
        })
    }

    /// Predict the next piece at every position.
    ///
    /// * `piece_ids` - Input sequence.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `train` - Whether to train the model.
    pub fn forward(
        &self,
        piece_ids: &Tensor,
        train: bool,
    ) -> Result<CausalLMOutput, TransformerCausalLMError> {
        let decoder_output = self
            .decoder
            .forward(piece_ids, train)
            .context(DecodeSnafu)?;

        let last_layer = decoder_output
            .layer_outputs()
            .last()
            .or(decoder_output.embedding_layer_output())
            .ok_or(TransformerCausalLMError::NoOutput)?;

        let logits = self
            .output_embeddings
            .forward(last_layer)
            .context(ComputeLogitsSnafu)?;

        Ok(CausalLMOutput::new(decoder_output, logits))
    }
}

impl CausalLM for TransformerCausalLM {
    fn forward_t(&self, piece_ids: &Tensor, train: bool) -> Result<CausalLMOutput, BoxedError> {
        Ok(self.forward(piece_ids, train)?)
    }

    fn max_seq_len(&self) -> usize {
        crate::architectures::Decoder::max_seq_len(&self.decoder)
    }
}
