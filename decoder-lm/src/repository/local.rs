use std::path::{Path, PathBuf};

use snafu::{ensure, Snafu};

use super::repo::Repo;
use crate::error::BoxedError;

/// `LocalRepo` errors.
#[derive(Debug, Snafu)]
pub enum LocalRepoError {
    #[snafu(display("Repository path {} is not a directory", path.to_string_lossy()))]
    NotADirectory { path: PathBuf },
}

/// Repository in a directory on the local machine.
#[derive(Clone, Debug)]
pub struct LocalRepo {
    path: PathBuf,
}

impl LocalRepo {
    /// Open a local repository.
    ///
    /// * `path` - Directory that contains the repository files.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, LocalRepoError> {
        let path = path.as_ref().to_path_buf();
        ensure!(path.is_dir(), NotADirectorySnafu { path });
        Ok(Self { path })
    }

    /// Directory of the repository.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Repo for LocalRepo {
    fn file(&self, path: impl AsRef<Path>) -> Result<Option<PathBuf>, BoxedError> {
        let full_path = self.path.join(path);
        Ok(full_path.is_file().then_some(full_path))
    }

    fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.path.join(path).is_file()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{LocalRepo, LocalRepoError};
    use crate::repository::repo::Repo;

    #[test]
    fn local_repo_finds_files() {
        let dir = tempfile::tempdir().expect("Cannot create temporary directory");
        fs::write(dir.path().join("config.json"), "{}").expect("Cannot write file");

        let repo = LocalRepo::new(dir.path()).expect("Cannot open repository");
        assert!(repo.exists("config.json"));
        assert!(!repo.exists("model.safetensors"));
        assert_eq!(
            repo.file("config.json").expect("Cannot get file"),
            Some(dir.path().join("config.json"))
        );
        assert_eq!(repo.file("tokenizer.json").expect("Cannot get file"), None);
    }

    #[test]
    fn local_repo_must_be_a_directory() {
        let dir = tempfile::tempdir().expect("Cannot create temporary directory");
        let file = dir.path().join("model.safetensors");
        fs::write(&file, "").expect("Cannot write file");

        assert!(matches!(
            LocalRepo::new(&file),
            Err(LocalRepoError::NotADirectory { .. })
        ));
    }
}
