/// Transformer decoder.
use candle_core::Tensor;
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::architectures::{
    BuildArchitecture, BuildDecoderLayer, Decoder, DecoderLayer, DecoderOutput,
};
use crate::error::BoxedError;
use crate::layers::transformer::{
    TransformerEmbeddings, TransformerEmbeddingsConfig, TransformerEmbeddingsError,
    TransformerLayerConfig,
};

/// Transformer decoder configuration.
#[derive(Debug)]
pub struct TransformerDecoderConfig {
    embeddings: TransformerEmbeddingsConfig,
    layer: Box<dyn BuildDecoderLayer>,
    n_hidden_layers: usize,
}

impl TransformerDecoderConfig {
    /// Decoder embeddings.
    ///
    /// Default: `TransformerEmbeddingsConfig::default()`
    pub fn embeddings(mut self, embeddings: TransformerEmbeddingsConfig) -> Self {
        self.embeddings = embeddings;
        self
    }

    /// Decoder layer.
    ///
    /// Default: `TransformerLayerConfig::default()`
    pub fn layer(mut self, layer: Box<dyn BuildDecoderLayer>) -> Self {
        self.layer = layer;
        self
    }

    /// Number of hidden layers.
    ///
    /// Default: `2`
    pub fn n_hidden_layers(mut self, n_hidden_layers: usize) -> Self {
        self.n_hidden_layers = n_hidden_layers;
        self
    }
}

impl Default for TransformerDecoderConfig {
    fn default() -> Self {
        Self {
            embeddings: TransformerEmbeddingsConfig::default(),
            layer: Box::<TransformerLayerConfig>::default(),
            n_hidden_layers: 2,
        }
    }
}

impl BuildArchitecture for TransformerDecoderConfig {
    type Architecture = TransformerDecoder;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        Ok(TransformerDecoder::new(vb, self)?)
    }
}

/// Transformer decoder errors.
#[derive(Debug, Snafu)]
pub enum TransformerDecoderError {
    #[snafu(display("Cannot build embeddings"))]
    BuildTransformerEmbeddings { source: TransformerEmbeddingsError },

    #[snafu(display("Cannot build transformer layer {layer}"))]
    BuildTransformerLayer { layer: usize, source: BoxedError },

    #[snafu(display("Cannot apply embeddings"))]
    Embedding { source: TransformerEmbeddingsError },

    #[snafu(display("Cannot apply transformer layer {layer}"))]
    TransformerLayer { layer: usize, source: BoxedError },
}

/// Decoder using the transformer architecture.
pub struct TransformerDecoder {
    embeddings: TransformerEmbeddings,
    layers: Vec<Box<dyn DecoderLayer>>,
}

impl TransformerDecoder {
    /// Construct a decoder.
    ///
    /// Layer `n` reads its parameters from the `layer_{n}` prefix.
    pub fn new(
        vb: VarBuilder,
        config: &TransformerDecoderConfig,
    ) -> Result<Self, TransformerDecoderError> {
        let embeddings = config
            .embeddings
            .build(vb.push_prefix("embeddings"))
            .context(BuildTransformerEmbeddingsSnafu)?;

        let layers = (0..config.n_hidden_layers)
            .map(|n| {
                config
                    .layer
                    .build_decoder_layer(vb.push_prefix(format!("layer_{n}")))
                    .context(BuildTransformerLayerSnafu { layer: n })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TransformerDecoder { embeddings, layers })
    }

    /// Decode an input sequence.
    ///
    /// * `piece_ids` - Input sequence.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `train` - Whether to train the layer.
    pub fn forward(
        &self,
        piece_ids: &Tensor,
        train: bool,
    ) -> Result<DecoderOutput, TransformerDecoderError> {
        let embeddings = self
            .embeddings
            .forward(piece_ids, train)
            .context(EmbeddingSnafu)?;

        let mut layer_output = embeddings.clone();
        let mut layer_outputs = Vec::with_capacity(self.layers.len());
        let mut attention_weights = Vec::with_capacity(self.layers.len());
        for (layer_idx, layer) in self.layers.iter().enumerate() {
            let (next_layer_output, layer_attention_weights) = layer
                .forward_t(&layer_output, train)
                .context(TransformerLayerSnafu { layer: layer_idx })?;

            layer_outputs.push(next_layer_output.clone());
            attention_weights.push(layer_attention_weights);
            layer_output = next_layer_output;
        }

        Ok(DecoderOutput::new(
            embeddings,
            layer_outputs,
            attention_weights,
        ))
    }
}

impl Decoder for TransformerDecoder {
    fn forward_t(&self, piece_ids: &Tensor, train: bool) -> Result<DecoderOutput, BoxedError> {
        Ok(self.forward(piece_ids, train)?)
    }

    fn max_seq_len(&self) -> usize {
        self.embeddings.max_seq_len()
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};
    use snafu::{report, FromString, OptionExt, ResultExt, Whatever};

    use super::{TransformerDecoderConfig, TransformerDecoderError};
    use crate::architectures::{BuildDecoder, Decoder, LayerOutputs};
    use crate::layers::attention::SelfAttentionConfig;
    use crate::layers::feedforward::PointwiseFeedForwardConfig;
    use crate::layers::layer_norm::LayerNormConfig;
    use crate::layers::transformer::{TransformerEmbeddingsConfig, TransformerLayerConfig};
    use crate::util::tests::SeededVars;

    fn decoder_config(n_hidden_layers: usize) -> TransformerDecoderConfig {
        TransformerDecoderConfig::default()
            .embeddings(
                TransformerEmbeddingsConfig::default()
                    .hidden_width(8)
                    .max_seq_len(6)
                    .n_pieces(10),
            )
            .layer(Box::new(
                TransformerLayerConfig::default()
                    .attention(Box::new(
                        SelfAttentionConfig::default().hidden_width(8).n_heads(2),
                    ))
                    .feedforward(Box::new(
                        PointwiseFeedForwardConfig::default()
                            .hidden_width(8)
                            .intermediate_width(16),
                    ))
                    .layer_norm(Box::new(LayerNormConfig::default().size(8))),
            ))
            .n_hidden_layers(n_hidden_layers)
    }

    #[test]
    #[report]
    fn decoder_returns_outputs_of_every_layer() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let vars = SeededVars::new(&device);
        let decoder = BuildDecoder::build(&decoder_config(3), vars.vb())
            .map_err(|e| Whatever::with_source(e, "Cannot build decoder".to_string()))?;
        vars.init(5)?;

        assert_eq!(decoder.max_seq_len(), 6);

        let piece_ids = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 7, 8]], &device)
            .whatever_context("Cannot create piece identifiers")?;
        let output = decoder
            .forward(&piece_ids, false)
            .whatever_context("Cannot decode")?;

        assert_eq!(
            output
                .embedding_layer_output()
                .whatever_context("No embedding output")?
                .dims(),
            &[2, 4, 8]
        );
        assert_eq!(output.layer_outputs().len(), 3);
        assert_eq!(output.attention_weights().len(), 3);
        for (layer_output, weights) in output
            .layer_outputs()
            .iter()
            .zip(output.attention_weights())
        {
            assert_eq!(layer_output.dims(), &[2, 4, 8]);
            assert_eq!(weights.dims(), &[2, 2, 4, 4]);
        }

        Ok(())
    }

    #[test]
    fn decoder_reports_embedding_errors() {
        let vars = SeededVars::new(&Device::Cpu);
        let decoder = BuildDecoder::build(&decoder_config(1), vars.vb())
            .expect("Cannot build decoder");

        let piece_ids = Tensor::new(&[[1u32, 2, 3, 4, 5, 6, 7]], &Device::Cpu)
            .expect("Cannot create piece identifiers");
        assert!(matches!(
            decoder.forward(&piece_ids, false),
            Err(TransformerDecoderError::Embedding { .. })
        ));
    }
}
