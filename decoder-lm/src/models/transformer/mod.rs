/// Transformer architecture implementations.
mod causal_lm;
pub use causal_lm::{TransformerCausalLM, TransformerCausalLMConfig, TransformerCausalLMError};

mod decoder;
pub use decoder::{TransformerDecoder, TransformerDecoderConfig, TransformerDecoderError};
