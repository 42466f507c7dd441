pub mod architectures;
pub mod checkpoint;
pub mod error;
pub mod generation;
pub mod layers;
pub mod models;
pub mod repository;
pub mod tokenizers;
pub mod training;
pub mod util;
