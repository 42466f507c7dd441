use std::fmt::Debug;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::architectures::output::LayerOutputs;
use crate::architectures::BuildArchitecture;
use crate::error::BoxedError;

/// Decoder output.
pub struct DecoderOutput {
    attention_weights: Vec<Tensor>,
    embedding_output: Tensor,
    layer_outputs: Vec<Tensor>,
}

impl DecoderOutput {
    /// Create a decoder output.
    ///
    /// * `embedding_output` - Output of the embedding layer.
    /// * `layer_outputs` - Output of every decoder layer, in layer order.
    /// * `attention_weights` - Attention weights of every decoder layer,
    ///   in layer order.
    pub fn new(
        embedding_output: Tensor,
        layer_outputs: Vec<Tensor>,
        attention_weights: Vec<Tensor>,
    ) -> Self {
        Self {
            attention_weights,
            embedding_output,
            layer_outputs,
        }
    }

    /// Attention weights of every decoder layer.
    ///
    /// *Shape of each layer:* `(batch_size, n_heads, seq_len, seq_len)`
    pub fn attention_weights(&self) -> &[Tensor] {
        &self.attention_weights
    }
}

impl LayerOutputs for DecoderOutput {
    fn layer_outputs(&self) -> &[Tensor] {
        &self.layer_outputs
    }

    fn embedding_layer_output(&self) -> Option<&Tensor> {
        Some(&self.embedding_output)
    }
}

/// Trait for building decoders.
pub trait BuildDecoder: Debug {
    /// Decoder type.
    type Decoder: Decoder;

    /// Build a decoder.
    fn build(&self, vb: VarBuilder) -> Result<Self::Decoder, BoxedError>;
}

impl<D> BuildDecoder for D
where
    D: BuildArchitecture + Debug,
    D::Architecture: Decoder,
{
    type Decoder = D::Architecture;

    fn build(&self, vb: VarBuilder) -> Result<Self::Decoder, BoxedError> {
        BuildArchitecture::build(self, vb)
    }
}

/// Trait for decoders.
pub trait Decoder {
    /// Decode an input sequence.
    ///
    /// * `piece_ids` - Input sequence.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `train` - Whether to train the layer.
    fn forward_t(&self, piece_ids: &Tensor, train: bool) -> Result<DecoderOutput, BoxedError>;

    /// Maximum sequence length that the decoder accepts.
    fn max_seq_len(&self) -> usize;
}

/// Trait for decoder layers.
pub trait DecoderLayer {
    /// Apply the decoder layer to the given hidden representations.
    ///
    /// * `input` - Hidden representations to apply the layer to.
    ///   *Shape:* `(batch_size, seq_len, width)`
    /// * `train` - Whether to train the layer.
    ///
    /// Returns layer output and the attention weights.
    /// *Shapes:* `(batch_size, seq_len, width)`,
    /// `(batch_size, n_heads, seq_len, seq_len)`
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<(Tensor, Tensor), BoxedError>;
}

/// Trait for building decoder layers.
pub trait BuildDecoderLayer: Debug {
    /// Build a decoder layer.
    fn build_decoder_layer(&self, vb: VarBuilder) -> Result<Box<dyn DecoderLayer>, BoxedError>;
}
