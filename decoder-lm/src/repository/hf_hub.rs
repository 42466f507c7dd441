use std::collections::HashSet;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiError, ApiRepo};
use hf_hub::{Repo as HubRepo, RepoType};
use snafu::{ResultExt, Snafu};

use super::repo::Repo;
use crate::error::BoxedError;

/// `HfHubRepo` errors.
#[derive(Debug, Snafu)]
pub enum HfHubRepoError {
    #[snafu(display("Cannot download '{path}' from Hugging Face Hub repository '{name}'"))]
    Download {
        name: String,
        path: String,
        source: ApiError,
    },

    #[snafu(display("Cannot create Hugging Face Hub client"))]
    HubClient { source: ApiError },

    #[snafu(display("Cannot list files of Hugging Face Hub repository '{name}'"))]
    ListFiles { name: String, source: ApiError },
}

/// Model repository on the Hugging Face Hub.
///
/// The file listing is fetched when the repository is opened. Files are
/// downloaded into the local Hugging Face cache when they are first
/// requested.
pub struct HfHubRepo {
    api_repo: ApiRepo,
    files: HashSet<String>,
    name: String,
}

impl HfHubRepo {
    /// Open a Hugging Face Hub model repository.
    ///
    /// * `name` - Repository name, e.g. `user/model`.
    /// * `revision` - Branch, tag or commit. The `main` branch is used
    ///   when `None`.
    pub fn new(name: &str, revision: Option<&str>) -> Result<Self, HfHubRepoError> {
        let revision = revision.unwrap_or("main");
        let api_repo = Api::new().context(HubClientSnafu)?.repo(HubRepo::with_revision(
            name.to_owned(),
            RepoType::Model,
            revision.to_owned(),
        ));

        let files = api_repo
            .info()
            .context(ListFilesSnafu { name })?
            .siblings
            .into_iter()
            .map(|sibling| sibling.rfilename)
            .collect::<HashSet<_>>();

        tracing::debug!(name, revision, n_files = files.len(), "opened hub repository");

        Ok(HfHubRepo {
            api_repo,
            files,
            name: name.to_owned(),
        })
    }

    /// Name of the repository.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Repo for HfHubRepo {
    fn file(&self, path: impl AsRef<Path>) -> Result<Option<PathBuf>, BoxedError> {
        if !self.exists(path.as_ref()) {
            return Ok(None);
        }

        let path = path.as_ref().to_string_lossy().into_owned();
        tracing::debug!(name = %self.name, file = %path, "fetching file");
        let local_path = self.api_repo.get(&path).context(DownloadSnafu {
            name: &self.name,
            path: &path,
        })?;

        Ok(Some(local_path))
    }

    fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.files.contains(&*path.as_ref().to_string_lossy())
    }
}
