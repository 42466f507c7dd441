use super::tokenizer::FromRepo;
use crate::error::BoxedError;
use crate::repository::hf_hub::HfHubRepo;

/// Tokenizers that can be downloaded from the Hugging Face Hub.
pub trait FromHFHub
where
    Self: FromRepo,
{
    /// Load the tokenizer of a Hugging Face Hub model.
    ///
    /// * `name` - Model name, e.g. `user/model`.
    /// * `revision` - Branch, tag or commit, `main` when `None`.
    fn from_hf_hub(name: &str, revision: Option<&str>) -> Result<Self, BoxedError> {
        let repo = HfHubRepo::new(name, revision)?;
        let tokenizer = Self::from_repo(&repo)?;
        tracing::info!(name = repo.name(), "loaded tokenizer from hub");
        Ok(tokenizer)
    }
}
