/// Transformer building blocks.
mod embeddings;
pub use embeddings::{TransformerEmbeddings, TransformerEmbeddingsConfig, TransformerEmbeddingsError};

mod layer;
pub use layer::{
    TransformerDropouts, TransformerLayer, TransformerLayerConfig, TransformerLayerError,
    TransformerLayerNorms,
};
