use std::fs::File;
use std::path::{Path, PathBuf};

use snafu::{OptionExt, ResultExt, Snafu};
use tokenizers::tokenizer::Tokenizer as HuggingFaceTokenizer;

use super::pieces::PiecesWithIds;
use super::tokenizer::FromRepo;
use super::{
    hf_hub::FromHFHub,
    tokenizer::{Tokenizer, TokenizerEncodeInput},
};
use crate::error::BoxedError;
use crate::repository::repo::Repo;

/// `HfTokenizer` errors.
#[derive(Debug, Snafu)]
pub enum HfTokenizerError {
    #[snafu(display("Couldn't encode tokenizer inputs into pieces and ids"))]
    Encode { source: tokenizers::Error },

    #[snafu(display("Couldn't decode piece identifiers into strings"))]
    Decode { source: tokenizers::Error },

    #[snafu(display("Couldn't open 'tokenizer.json'"))]
    OpenTokenizerJSON { source: BoxedError },

    #[snafu(display("'tokenizer.json' file is missing"))]
    MissingTokenizerJSON,

    #[snafu(display("Couldn't open 'tokenizer_config.json'"))]
    OpenTokenizerConfigJSON { source: BoxedError },

    #[snafu(display("Couldn't open 'special_tokens_map.json'"))]
    OpenSpecialTokensMapJSON { source: BoxedError },

    #[snafu(display("Couldn't open JSON file at {}", path.to_string_lossy()))]
    OpenJSON {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Cannot deserialize JSON file at {}", path.to_string_lossy()))]
    DeserializeJSON {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Couldn't load Hugging Face tokenizer from {}", path.to_string_lossy()))]
    LoadHFTokenizer { path: PathBuf, source: BoxedError },

    #[snafu(display("Couldn't save tokenizer to {}", path.to_string_lossy()))]
    SaveTokenizer { path: PathBuf, source: BoxedError },

    #[snafu(display("Couldn't write tokenizer configuration to {}", path.to_string_lossy()))]
    SaveTokenizerConfig {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Cannot serialize tokenizer configuration"))]
    SerializeConfig { source: serde_json::Error },
}

/// Wraps the tokenizers from the HuggingFace `tokenizers` package. It supports a
/// wide range of piece tokenizers, including word-level, word piece, byte pair
/// encoding, and sentencepiece unigram tokenizers.
pub struct HfTokenizer {
    tokenizer: HuggingFaceTokenizer,
    eos_piece: Option<String>,
}

impl HfTokenizer {
    fn new(
        tokenizer: HuggingFaceTokenizer,
        config: Option<&config::ConfigWithEosToken>,
        special_tokens_map: Option<&config::ConfigWithEosToken>,
    ) -> Self {
        let eos_piece = config
            .and_then(|e| e.eos_token())
            .or_else(|| special_tokens_map.and_then(|e| e.eos_token()));

        Self {
            tokenizer,
            eos_piece: eos_piece.cloned(),
        }
    }

    /// Wrap a Hugging Face tokenizer.
    ///
    /// * `tokenizer` - The tokenizer to wrap.
    /// * `eos_piece` - End-of-sequence piece, if the vocabulary has one.
    pub fn from_tokenizer(tokenizer: HuggingFaceTokenizer, eos_piece: Option<String>) -> Self {
        Self {
            tokenizer,
            eos_piece,
        }
    }

    /// Load a tokenizer from a `tokenizer.json` file.
    ///
    /// * `path` - Path of the tokenizer file.
    /// * `eos_piece` - End-of-sequence piece, if the vocabulary has one.
    pub fn from_file(
        path: impl AsRef<Path>,
        eos_piece: Option<String>,
    ) -> Result<Self, HfTokenizerError> {
        let tokenizer = HuggingFaceTokenizer::from_file(path.as_ref()).context(
            LoadHFTokenizerSnafu {
                path: path.as_ref(),
            },
        )?;
        Ok(Self::from_tokenizer(tokenizer, eos_piece))
    }

    /// Save the tokenizer to a directory.
    ///
    /// Writes `tokenizer.json` and, when an end-of-sequence piece is set,
    /// a `tokenizer_config.json` that records it.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<(), HfTokenizerError> {
        let tokenizer_path = dir.as_ref().join("tokenizer.json");
        self.tokenizer
            .save(&tokenizer_path, false)
            .context(SaveTokenizerSnafu {
                path: &tokenizer_path,
            })?;

        if let Some(eos_piece) = &self.eos_piece {
            let config_path = dir.as_ref().join("tokenizer_config.json");
            let file = File::create(&config_path).context(SaveTokenizerConfigSnafu {
                path: &config_path,
            })?;
            serde_json::to_writer(file, &config::ConfigWithEosToken::with_eos_token(eos_piece))
                .context(SerializeConfigSnafu)?;
        }

        Ok(())
    }

    fn try_parse_json_config(
        path: &impl AsRef<Path>,
    ) -> Result<Option<config::ConfigWithEosToken>, BoxedError> {
        let file = File::open(path.as_ref()).context(OpenJSONSnafu {
            path: path.as_ref(),
        })?;

        let deserialized: Option<config::ConfigWithEosToken> = serde_json::from_reader(file)
            .context(DeserializeJSONSnafu {
                path: path.as_ref().to_owned(),
            })
            .boxed()?;

        Ok(deserialized)
    }
}

impl Tokenizer for HfTokenizer {
    fn encode<V, I>(&self, input: V) -> Result<PiecesWithIds, BoxedError>
    where
        V: AsRef<[TokenizerEncodeInput<I>]>,
        I: AsRef<str>,
    {
        let converted_input = input
            .as_ref()
            .iter()
            .map(|input| match input {
                TokenizerEncodeInput::RawString(s) => {
                    tokenizers::EncodeInput::Single(s.as_ref().into())
                }
            })
            .collect::<Vec<_>>();

        let encoding = self
            .tokenizer
            .encode_batch(converted_input, true)
            .context(EncodeSnafu)?;

        Ok(PiecesWithIds {
            ids: encoding
                .iter()
                .map(|ids| ids.get_ids().to_owned())
                .collect(),
            pieces: encoding
                .iter()
                .map(|ids| ids.get_tokens().to_owned())
                .collect(),
        })
    }

    fn decode<V, I>(&self, input: V, skip_special_pieces: bool) -> Result<Vec<String>, BoxedError>
    where
        V: AsRef<[I]>,
        I: AsRef<[u32]>,
    {
        let converted_input = input
            .as_ref()
            .iter()
            .map(|input| input.as_ref())
            .collect::<Vec<_>>();

        self.tokenizer
            .decode_batch(&converted_input, skip_special_pieces)
            .context(DecodeSnafu)
            .boxed()
    }

    fn piece_to_id(&self, piece: impl AsRef<str>) -> Option<u32> {
        self.tokenizer.token_to_id(piece.as_ref())
    }

    fn eos_piece(&self) -> Option<&str> {
        self.eos_piece.as_deref()
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

impl FromRepo for HfTokenizer {
    fn from_repo(repo: &impl Repo) -> Result<Self, BoxedError> {
        let tokenizer_json = repo
            .file("tokenizer.json")
            .context(OpenTokenizerJSONSnafu)?
            .context(MissingTokenizerJSONSnafu)?;
        let tokenizer_config_json = repo
            .file("tokenizer_config.json")
            .context(OpenTokenizerConfigJSONSnafu)?;
        let special_tokens_map_json = repo
            .file("special_tokens_map.json")
            .context(OpenSpecialTokensMapJSONSnafu)?;

        let tokenizer = HuggingFaceTokenizer::from_file(&tokenizer_json).context(
            LoadHFTokenizerSnafu {
                path: &tokenizer_json,
            },
        )?;

        let tokenizer_config = tokenizer_config_json
            .map(|p| Self::try_parse_json_config(&p))
            .transpose()?
            .flatten();

        let special_tokens_map = special_tokens_map_json
            .map(|p| Self::try_parse_json_config(&p))
            .transpose()?
            .flatten();

        Ok(Self::new(
            tokenizer,
            tokenizer_config.as_ref(),
            special_tokens_map.as_ref(),
        ))
    }
}

impl FromHFHub for HfTokenizer {}

mod config {
    use std::collections::HashMap;

    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    /// Represents an EOS token in the tokenizer configuration.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(untagged)]
    pub(super) enum EosTokenInConfig {
        Default(String),
        Wrapped { content: Option<String> },
    }

    /// Represents a tokenizer configuration that includes an EOS token.
    /// Primarily used to with `tokenizer_config.json` and `special_tokens_map.json` files.
    #[derive(Debug, Clone, Serialize, Deserialize, Default)]
    pub(super) struct ConfigWithEosToken {
        #[serde(default)]
        eos_token: Option<EosTokenInConfig>,
        #[serde(flatten)]
        _extra: HashMap<String, Value>,
    }

    impl ConfigWithEosToken {
        pub(super) fn with_eos_token(eos_token: &str) -> Self {
            Self {
                eos_token: Some(EosTokenInConfig::Default(eos_token.to_owned())),
                _extra: HashMap::new(),
            }
        }

        pub(super) fn eos_token(&self) -> Option<&String> {
            self.eos_token.as_ref().and_then(|e| match e {
                EosTokenInConfig::Default(s) => Some(s),
                EosTokenInConfig::Wrapped { content } => content.as_ref(),
            })
        }
    }
}
