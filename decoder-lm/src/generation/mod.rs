//! Text generation with causal language models.

mod generator;
pub use generator::{FinishReason, GenerationConfig, GenerationError, Generated, Generator};

mod sampler;
pub use sampler::{Sampler, SamplerError};
