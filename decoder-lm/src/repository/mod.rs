/// Repositories that hold checkpoints and tokenizers.
pub mod hf_hub;

pub mod local;

pub mod repo;
