/// Traits for model architectures.
use candle_nn::VarBuilder;

mod causal_lm;
pub use causal_lm::{BuildCausalLM, CausalLM, CausalLMOutput};

mod decoder;
pub use decoder::{BuildDecoder, BuildDecoderLayer, Decoder, DecoderLayer, DecoderOutput};

mod output;
pub use output::LayerOutputs;

use crate::error::BoxedError;

/// Trait for building model architectures.
pub trait BuildArchitecture {
    /// The architecture to build.
    type Architecture;

    /// Build the architecture.
    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError>;
}
