use std::path::{Path, PathBuf};

use candle_core::{Device, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap, SGD};
use clap::{Args, Parser, Subcommand, ValueEnum};
use snafu::{ensure_whatever, whatever, FromString, ResultExt, Whatever};

use decoder_lm::checkpoint::{save_checkpoint, Checkpoint, LoadCheckpoint};
use decoder_lm::generation::{GenerationConfig, Generator, Sampler};
use decoder_lm::layers::activation::Activation;
use decoder_lm::models::transformer::{TransformerCausalLM, TransformerCausalLMConfig};
use decoder_lm::repository::hf_hub::HfHubRepo;
use decoder_lm::repository::local::LocalRepo;
use decoder_lm::repository::repo::Repo;
use decoder_lm::tokenizers::hf_hub::FromHFHub;
use decoder_lm::tokenizers::hf_tokenizer::HfTokenizer;
use decoder_lm::tokenizers::tokenizer::{FromRepo, Tokenizer};
use decoder_lm::training::{NextTokenBatches, TextCorpus, Trainer, TrainerConfig};

#[derive(Parser, Debug)]
#[command(name = "decoder-lm", about = "Train and sample a small decoder-only language model")]
struct Cli {
    /// Device to run the model on.
    #[arg(long, value_enum, default_value = "cpu")]
    device: DeviceArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DeviceArg {
    Cpu,
    Cuda,
    Metal,
}

impl DeviceArg {
    fn device(self) -> Result<Device, Whatever> {
        match self {
            DeviceArg::Cpu => Ok(Device::Cpu),
            DeviceArg::Cuda => Device::new_cuda(0).whatever_context("Cannot open CUDA device"),
            DeviceArg::Metal => Device::new_metal(0).whatever_context("Cannot open Metal device"),
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ActivationArg {
    Gelu,
    Relu,
}

impl From<ActivationArg> for Activation {
    fn from(value: ActivationArg) -> Self {
        match value {
            ActivationArg::Gelu => Activation::Gelu,
            ActivationArg::Relu => Activation::Relu,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OptimizerArg {
    Adamw,
    Sgd,
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Text file with one training row per line.
    #[arg(long)]
    corpus: PathBuf,
    /// Text file used to report the validation loss after every epoch.
    #[arg(long)]
    validation_corpus: Option<PathBuf>,
    /// Hugging Face `tokenizer.json` file.
    #[arg(long, required_unless_present = "tokenizer_hub")]
    tokenizer: Option<PathBuf>,
    /// Use the tokenizer of this Hugging Face Hub model.
    #[arg(long, conflicts_with_all = ["tokenizer", "eos_piece"])]
    tokenizer_hub: Option<String>,
    /// End-of-sequence piece, appended after every row.
    #[arg(long)]
    eos_piece: Option<String>,
    /// Directory to write the checkpoint and tokenizer to.
    #[arg(long)]
    output: PathBuf,
    #[arg(long, value_enum, default_value = "relu")]
    activation: ActivationArg,
    #[arg(long, default_value_t = 0.1)]
    dropout: f32,
    #[arg(long, default_value_t = 64)]
    hidden_width: usize,
    #[arg(long, default_value_t = 256)]
    intermediate_width: usize,
    #[arg(long, default_value_t = 50)]
    max_seq_len: usize,
    #[arg(long, default_value_t = 4)]
    n_heads: usize,
    #[arg(long, default_value_t = 2)]
    n_layers: usize,
    /// Let every piece attend to succeeding pieces as well.
    #[arg(long)]
    non_causal: bool,
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
    #[arg(long, default_value_t = 3)]
    epochs: usize,
    #[arg(long, value_enum, default_value = "adamw")]
    optimizer: OptimizerArg,
    #[arg(long, default_value_t = 1e-3)]
    learning_rate: f64,
    /// Maximum global gradient norm, 0 disables clipping.
    #[arg(long, default_value_t = 1.0)]
    max_grad_norm: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

impl TrainArgs {
    /// Model configuration, the vocabulary size is set from the tokenizer.
    fn model_config(&self) -> TransformerCausalLMConfig {
        TransformerCausalLMConfig::default()
            .activation(self.activation.into())
            .causal(!self.non_causal)
            .dropout(self.dropout)
            .hidden_width(self.hidden_width)
            .intermediate_width(self.intermediate_width)
            .max_seq_len(self.max_seq_len)
            .n_heads(self.n_heads)
            .n_layers(self.n_layers)
    }

    fn adamw(&self, vars: Vec<Var>) -> Result<AdamW, candle_core::Error> {
        AdamW::new(
            vars,
            ParamsAdamW {
                lr: self.learning_rate,
                ..Default::default()
            },
        )
    }

    fn trainer_config(&self) -> TrainerConfig {
        TrainerConfig::default()
            .max_grad_norm((self.max_grad_norm > 0.).then_some(self.max_grad_norm))
    }

    fn tokenizer_source(&self) -> Result<TokenizerSource, Whatever> {
        match (&self.tokenizer, &self.tokenizer_hub) {
            (_, Some(name)) => Ok(TokenizerSource::Hub(name.clone())),
            (Some(path), None) => Ok(TokenizerSource::File {
                path: path.clone(),
                eos_piece: self.eos_piece.clone(),
            }),
            (None, None) => whatever!("Either --tokenizer or --tokenizer-hub is required"),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model on a line-per-row text corpus.
    Train(TrainArgs),
    /// Continue a prompt with a trained model.
    Generate {
        /// Checkpoint directory written by `train`.
        #[arg(long, required_unless_present = "hub_model")]
        checkpoint: Option<PathBuf>,
        /// Load the checkpoint and tokenizer from this Hugging Face Hub model.
        #[arg(long, conflicts_with = "checkpoint")]
        hub_model: Option<String>,
        /// Hub model revision, `main` when absent.
        #[arg(long, requires = "hub_model")]
        revision: Option<String>,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value_t = 50)]
        max_new_tokens: usize,
        /// Sample with this temperature instead of picking the most probable piece.
        #[arg(long)]
        temperature: Option<f32>,
        /// Only sample from the k most probable pieces.
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

enum TokenizerSource {
    File {
        path: PathBuf,
        eos_piece: Option<String>,
    },
    Hub(String),
}

impl TokenizerSource {
    fn load(self) -> Result<HfTokenizer, Whatever> {
        match self {
            TokenizerSource::File { path, eos_piece } => HfTokenizer::from_file(&path, eos_piece)
                .with_whatever_context(|_| format!("Cannot load tokenizer {}", path.display())),
            TokenizerSource::Hub(name) => HfTokenizer::from_hf_hub(&name, None)
                .map_err(|e| Whatever::with_source(e, format!("Cannot load tokenizer of {name}"))),
        }
    }
}

struct TrainingData {
    train: NextTokenBatches,
    validation: Option<NextTokenBatches>,
}

fn load_batches(
    corpus: &Path,
    tokenizer: &HfTokenizer,
    batch_size: usize,
    seq_len: usize,
    device: &Device,
) -> Result<NextTokenBatches, Whatever> {
    let piece_ids = TextCorpus::from_file(corpus)
        .and_then(|corpus| corpus.piece_ids(tokenizer))
        .with_whatever_context(|_| format!("Cannot read corpus {}", corpus.display()))?;
    tracing::info!(path = %corpus.display(), n_pieces = piece_ids.len(), "loaded corpus");

    let batches = NextTokenBatches::new(piece_ids, batch_size, seq_len, device)
        .whatever_context("Cannot create batches")?;
    ensure_whatever!(
        !batches.is_empty(),
        "Corpus {} is too small for a single batch",
        corpus.display()
    );

    Ok(batches)
}

fn train_with<O: Optimizer>(
    model: TransformerCausalLM,
    varmap: &VarMap,
    optimizer: O,
    trainer_config: TrainerConfig,
    data: &TrainingData,
    epochs: usize,
    seed: u64,
) -> Result<(), Whatever> {
    let mut trainer = Trainer::new(model, optimizer, varmap.all_vars(), trainer_config);
    for epoch in 1..=epochs {
        trainer
            .train_epoch(epoch, data.train.shuffled(seed.wrapping_add(epoch as u64)))
            .with_whatever_context(|_| format!("Cannot train epoch {epoch}"))?;

        if let Some(validation) = &data.validation {
            trainer
                .evaluate(validation.iter())
                .whatever_context("Cannot evaluate on validation corpus")?;
        }
    }

    Ok(())
}

fn train(device: &Device, args: TrainArgs) -> Result<(), Whatever> {
    let tokenizer = args.tokenizer_source()?.load()?;
    let config = args.model_config().n_pieces(tokenizer.vocab_size());
    let seq_len = config.get_max_seq_len();
    if !config.get_causal() {
        tracing::warn!("training without a causal mask, pieces can attend to their targets");
    }

    let data = TrainingData {
        train: load_batches(&args.corpus, &tokenizer, args.batch_size, seq_len, device)?,
        validation: args
            .validation_corpus
            .as_ref()
            .map(|path| load_batches(path, &tokenizer, args.batch_size, seq_len, device))
            .transpose()?,
    };

    let Checkpoint {
        config,
        model,
        varmap,
    } = Checkpoint::initialize(config, device, args.seed)
        .whatever_context("Cannot create model")?;

    let trainer_config = args.trainer_config();
    let (epochs, seed) = (args.epochs, args.seed);
    match args.optimizer {
        OptimizerArg::Adamw => {
            let optimizer = args
                .adamw(varmap.all_vars())
                .whatever_context("Cannot create optimizer")?;
            train_with(model, &varmap, optimizer, trainer_config, &data, epochs, seed)?
        }
        OptimizerArg::Sgd => {
            let optimizer = SGD::new(varmap.all_vars(), args.learning_rate)
                .whatever_context("Cannot create optimizer")?;
            train_with(model, &varmap, optimizer, trainer_config, &data, epochs, seed)?
        }
    }

    save_checkpoint(&args.output, &config, &varmap).whatever_context("Cannot save checkpoint")?;
    tokenizer
        .save(&args.output)
        .whatever_context("Cannot save tokenizer")?;

    Ok(())
}

fn generate(
    device: &Device,
    repo: &impl Repo,
    prompt: String,
    generation_config: GenerationConfig,
) -> Result<(), Whatever> {
    let Checkpoint { model, .. } = repo
        .load_checkpoint(device)
        .map_err(|e| Whatever::with_source(e, "Cannot load checkpoint".to_string()))?;
    let tokenizer = HfTokenizer::from_repo(repo)
        .map_err(|e| Whatever::with_source(e, "Cannot load tokenizer".to_string()))?;

    let generator = Generator::new(model, tokenizer, device);
    let generated = generator
        .generate(&prompt, &generation_config)
        .whatever_context("Cannot generate text")?;
    tracing::info!(
        n_generated = generated.piece_ids.len(),
        finish_reason = ?generated.finish_reason,
        "generated continuation"
    );

    println!("{prompt} {}", generated.text);

    Ok(())
}

#[snafu::report]
fn main() -> Result<(), Whatever> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("decoder_lm=info")),
        )
        .init();

    let cli = Cli::parse();
    let device = cli.device.device()?;

    match cli.command {
        Command::Train(args) => train(&device, args),
        Command::Generate {
            checkpoint,
            hub_model,
            revision,
            prompt,
            max_new_tokens,
            temperature,
            top_k,
            seed,
        } => {
            let sampler = match (top_k, temperature) {
                (Some(k), temperature) => Sampler::TopK {
                    k,
                    temperature: temperature.unwrap_or(1.0),
                },
                (None, Some(temperature)) => Sampler::Temperature { temperature },
                (None, None) => Sampler::Greedy,
            };
            let generation_config = GenerationConfig::default()
                .max_new_tokens(max_new_tokens)
                .sampler(sampler)
                .seed(seed);
            match (checkpoint, hub_model) {
                (_, Some(name)) => {
                    let repo = HfHubRepo::new(&name, revision.as_deref())
                        .with_whatever_context(|_| format!("Cannot open hub model {name}"))?;
                    generate(&device, &repo, prompt, generation_config)
                }
                (Some(checkpoint), None) => {
                    let repo = LocalRepo::new(&checkpoint)
                        .whatever_context("Cannot open checkpoint directory")?;
                    generate(&device, &repo, prompt, generation_config)
                }
                (None, None) => whatever!("Either --checkpoint or --hub-model is required"),
            }
        }
    }
}
