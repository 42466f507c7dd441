//! Training of causal language models.

mod batches;
pub use batches::{Batch, BatchError, NextTokenBatches};

mod corpus;
pub use corpus::{CorpusError, TextCorpus};

mod loss;
pub use loss::{next_token_loss, shift_for_next_token, LossError};

mod trainer;
pub use trainer::{clip_grad_norm, EpochSummary, Trainer, TrainerConfig, TrainerError};
