//! Line-per-row text corpora.

use std::fs;
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::tokenizers::tokenizer::{Tokenizer, TokenizerEncodeInput};

/// Errors for text corpora.
#[derive(Debug, Snafu)]
pub enum CorpusError {
    #[snafu(display("Cannot read corpus from {}", path.to_string_lossy()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Cannot tokenize corpus"))]
    Tokenize { source: BoxedError },
}

/// Text corpus with one row per line.
///
/// Empty and whitespace-only lines are skipped.
#[derive(Clone, Debug, Default)]
pub struct TextCorpus {
    rows: Vec<String>,
}

impl TextCorpus {
    /// Create a corpus from rows of text.
    pub fn from_rows<I, S>(rows: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rows: rows
                .into_iter()
                .map(Into::into)
                .filter(|row: &String| !row.trim().is_empty())
                .collect(),
        }
    }

    /// Read a corpus from a text file.
    ///
    /// * `path` - File with one row of text per line.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CorpusError> {
        let text = fs::read_to_string(path.as_ref()).context(ReadSnafu {
            path: path.as_ref(),
        })?;
        Ok(Self::from_rows(text.lines()))
    }

    /// Rows of the corpus.
    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    /// Tokenize the corpus into a single stream of piece identifiers.
    ///
    /// When the tokenizer has an end-of-sequence piece, it is appended
    /// after every row, so that a model learns where rows end.
    pub fn piece_ids(&self, tokenizer: &impl Tokenizer) -> Result<Vec<u32>, CorpusError> {
        let input = self
            .rows
            .iter()
            .map(|row| TokenizerEncodeInput::RawString(row.as_str()))
            .collect::<Vec<_>>();
        let encoded = tokenizer.encode(input).context(TokenizeSnafu)?;

        Ok(encoded.into_stream(tokenizer.eos_piece_id()))
    }
}
