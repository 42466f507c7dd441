/// Tokenizers.
pub mod hf_hub;

pub mod hf_tokenizer;

pub mod pieces;

pub mod tokenizer;
