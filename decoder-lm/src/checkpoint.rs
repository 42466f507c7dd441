//! Model checkpoints.
//!
//! A checkpoint directory contains the model configuration (`config.json`)
//! and all model parameters (`model.safetensors`).

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::models::transformer::{
    TransformerCausalLM, TransformerCausalLMConfig, TransformerCausalLMError,
};
use crate::repository::repo::Repo;
use crate::util::init::{init_parameters, InitError};

static CONFIG_JSON: &str = "config.json";
static SAFETENSORS: &str = "model.safetensors";

/// Checkpoint errors.
#[derive(Debug, Snafu)]
pub enum CheckpointError {
    #[snafu(display("Cannot construct model"))]
    ConstructModel { source: TransformerCausalLMError },

    #[snafu(display("Cannot create config file: {}", path.to_string_lossy()))]
    CreateConfig { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot create checkpoint directory: {}", path.to_string_lossy()))]
    CreateDirectory { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot get checkpoint file: {name}"))]
    Download { source: BoxedError, name: String },

    #[snafu(display("Cannot initialize model parameters"))]
    InitParameters { source: InitError },

    #[snafu(display("Cannot load model parameters from: {}", path.to_string_lossy()))]
    LoadParameters {
        source: candle_core::Error,
        path: PathBuf,
    },

    #[snafu(display("Checkpoint file does not exist: {name}"))]
    NonExistentFile { name: String },

    #[snafu(display("Cannot open config file: {}", path.to_string_lossy()))]
    OpenConfig { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot parse config file: {}", path.to_string_lossy()))]
    ParseConfig {
        source: serde_json::Error,
        path: PathBuf,
    },

    #[snafu(display("Cannot save model parameters to: {}", path.to_string_lossy()))]
    SaveParameters {
        source: candle_core::Error,
        path: PathBuf,
    },

    #[snafu(display("Cannot write config file: {}", path.to_string_lossy()))]
    WriteConfig {
        source: serde_json::Error,
        path: PathBuf,
    },
}

/// A model with its configuration and parameter store.
///
/// The model reads its parameters from `varmap`, so updating the variables
/// in `varmap` (e.g. with an optimizer) updates the model.
pub struct Checkpoint {
    pub config: TransformerCausalLMConfig,
    pub model: TransformerCausalLM,
    pub varmap: VarMap,
}

impl Checkpoint {
    /// Construct a model with freshly initialized parameters.
    ///
    /// * `config` - Model configuration.
    /// * `device` - Device to allocate the parameters on.
    /// * `seed` - Seed for parameter initialization.
    pub fn initialize(
        config: TransformerCausalLMConfig,
        device: &Device,
        seed: u64,
    ) -> Result<Self, CheckpointError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = TransformerCausalLM::new(vb, &config).context(ConstructModelSnafu)?;
        init_parameters(&varmap, seed).context(InitParametersSnafu)?;

        tracing::info!(
            n_parameters = n_parameters(&varmap),
            seed,
            "initialized model"
        );

        Ok(Checkpoint {
            config,
            model,
            varmap,
        })
    }

    /// Save the checkpoint to a directory.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<(), CheckpointError> {
        save_checkpoint(dir, &self.config, &self.varmap)
    }
}

/// Save a model configuration and its parameters.
///
/// * `dir` - Checkpoint directory, created when it does not exist.
/// * `config` - Model configuration.
/// * `varmap` - Model parameters.
pub fn save_checkpoint(
    dir: impl AsRef<Path>,
    config: &TransformerCausalLMConfig,
    varmap: &VarMap,
) -> Result<(), CheckpointError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).context(CreateDirectorySnafu { path: dir })?;

    let config_path = dir.join(CONFIG_JSON);
    let config_file = BufWriter::new(
        File::create(&config_path).context(CreateConfigSnafu {
            path: config_path.clone(),
        })?,
    );
    serde_json::to_writer_pretty(config_file, config).context(WriteConfigSnafu {
        path: config_path.clone(),
    })?;

    let parameters_path = dir.join(SAFETENSORS);
    varmap.save(&parameters_path).context(SaveParametersSnafu {
        path: parameters_path.clone(),
    })?;

    tracing::info!(
        path = %dir.display(),
        n_parameters = n_parameters(varmap),
        "saved checkpoint"
    );

    Ok(())
}

/// Extension trait for loading checkpoints from a repository.
pub trait LoadCheckpoint {
    /// Load a model checkpoint.
    ///
    /// * `device` - Device to load the parameters on.
    fn load_checkpoint(&self, device: &Device) -> Result<Checkpoint, BoxedError>;
}

impl<R> LoadCheckpoint for R
where
    R: Repo,
{
    fn load_checkpoint(&self, device: &Device) -> Result<Checkpoint, BoxedError> {
        let config_path = required_file(self, CONFIG_JSON)?;
        let config_file = BufReader::new(File::open(&config_path).context(OpenConfigSnafu {
            path: config_path.clone(),
        })?);
        let config: TransformerCausalLMConfig = serde_json::from_reader(config_file)
            .context(ParseConfigSnafu {
                path: config_path.clone(),
            })?;

        let parameters_path = required_file(self, SAFETENSORS)?;

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = TransformerCausalLM::new(vb, &config).context(ConstructModelSnafu)?;
        varmap
            .load(&parameters_path)
            .context(LoadParametersSnafu {
                path: parameters_path.clone(),
            })?;

        tracing::info!(
            path = %parameters_path.display(),
            n_parameters = n_parameters(&varmap),
            "loaded checkpoint"
        );

        Ok(Checkpoint {
            config,
            model,
            varmap,
        })
    }
}

fn required_file(repo: &impl Repo, name: &str) -> Result<PathBuf, CheckpointError> {
    repo.file(name)
        .context(DownloadSnafu { name })?
        .context(NonExistentFileSnafu { name })
}

fn n_parameters(varmap: &VarMap) -> usize {
    varmap
        .all_vars()
        .iter()
        .map(|var| var.elem_count())
        .sum()
}
