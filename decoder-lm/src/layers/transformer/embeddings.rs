use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{embedding, Embedding, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::embeddings::{SinusoidalPositions, SinusoidalPositionsError};
use crate::layers::identity::Identity;
use crate::util::tensor_ext::IdRange;

/// Transformer embeddings configuration.
#[derive(Debug)]
pub struct TransformerEmbeddingsConfig {
    dropout: Box<dyn BuildModule>,
    hidden_width: usize,
    max_seq_len: usize,
    n_pieces: usize,
    position_base: usize,
}

impl TransformerEmbeddingsConfig {
    /// Dropout applied to the embeddings.
    ///
    /// Default: `Identity`
    pub fn dropout(mut self, dropout: Box<dyn BuildModule>) -> Self {
        self.dropout = dropout;
        self
    }

    /// Width of the embeddings, must be even.
    ///
    /// Default: `64`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Maximum sequence length.
    ///
    /// Default: `512`
    pub fn max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = max_seq_len;
        self
    }

    /// Number of pieces in the vocabulary.
    ///
    /// Default: `1000`
    pub fn n_pieces(mut self, n_pieces: usize) -> Self {
        self.n_pieces = n_pieces;
        self
    }

    /// Base of the wavelengths of the sinusoidal positions.
    ///
    /// Default: `10_000`
    pub fn position_base(mut self, position_base: usize) -> Self {
        self.position_base = position_base;
        self
    }

    /// Build the embeddings layer.
    pub fn build(&self, vb: VarBuilder) -> Result<TransformerEmbeddings, TransformerEmbeddingsError> {
        let piece_embeddings = embedding(
            self.n_pieces,
            self.hidden_width,
            vb.push_prefix("piece_embeddings"),
        )
        .context(ConstructionSnafu)?;

        let positions = SinusoidalPositions::new(
            self.hidden_width,
            self.max_seq_len,
            self.position_base,
            vb.device(),
        )
        .context(PositionsSnafu)?;

        Ok(TransformerEmbeddings {
            dropout: self
                .dropout
                .build(vb.push_prefix("dropout"))
                .context(BuildDropoutSnafu)?,
            n_pieces: self.n_pieces,
            piece_embeddings,
            positions,
        })
    }
}

impl Default for TransformerEmbeddingsConfig {
    fn default() -> Self {
        Self {
            dropout: Box::new(Identity),
            hidden_width: 64,
            max_seq_len: 512,
            n_pieces: 1000,
            position_base: 10_000,
        }
    }
}

/// Errors for transformer embeddings.
#[derive(Debug, Snafu)]
pub enum TransformerEmbeddingsError {
    #[snafu(display("Cannot build dropout"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot construct embeddings layer"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Cannot apply dropout"))]
    Dropout { source: candle_core::Error },

    #[snafu(display("Cannot embed an empty sequence"))]
    EmptySequence,

    #[snafu(display("Piece identifiers must have shape (batch_size, seq_len)"))]
    InvalidShape { source: candle_core::Error },

    #[snafu(display("Cannot lookup piece embeddings"))]
    PieceEmbeddings { source: candle_core::Error },

    #[snafu(display("Piece identifier {piece_id} is not in the vocabulary of {n_pieces} pieces"))]
    PieceIdOutOfRange { piece_id: i64, n_pieces: usize },

    #[snafu(display("Cannot create or add position encodings"))]
    Positions { source: SinusoidalPositionsError },

    #[snafu(display(
        "Sequence length {seq_len} exceeds the maximum sequence length {max_seq_len}"
    ))]
    SequenceTooLong { seq_len: usize, max_seq_len: usize },
}

/// Transformer embeddings layer.
///
/// Looks up the piece embeddings and adds sinusoidal position encodings.
pub struct TransformerEmbeddings {
    dropout: Box<dyn ModuleT>,
    n_pieces: usize,
    piece_embeddings: Embedding,
    positions: SinusoidalPositions,
}

impl TransformerEmbeddings {
    /// Maximum sequence length supported by the position encodings.
    pub fn max_seq_len(&self) -> usize {
        self.positions.max_seq_len()
    }

    /// Calculate the piece embeddings.
    ///
    /// * `piece_ids` - Piece identifiers.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `train` - Whether to train the layer.
    ///
    /// Returns: Piece embeddings with position encodings.
    /// *Shape:* `(batch_size, seq_len, hidden_width)`
    pub fn forward(
        &self,
        piece_ids: &Tensor,
        train: bool,
    ) -> Result<Tensor, TransformerEmbeddingsError> {
        let (_, seq_len) = piece_ids.dims2().context(InvalidShapeSnafu)?;
        ensure!(seq_len > 0, EmptySequenceSnafu);
        ensure!(
            seq_len <= self.max_seq_len(),
            SequenceTooLongSnafu {
                seq_len,
                max_seq_len: self.max_seq_len()
            }
        );
        self.check_piece_ids(piece_ids)?;

        let embeddings = self
            .piece_embeddings
            .forward(piece_ids)
            .context(PieceEmbeddingsSnafu)?;

        let embeddings = self
            .positions
            .forward(&embeddings)
            .context(PositionsSnafu)?;

        self.dropout
            .forward_t(&embeddings, train)
            .context(DropoutSnafu)
    }

    fn check_piece_ids(&self, piece_ids: &Tensor) -> Result<(), TransformerEmbeddingsError> {
        let (min, max) = piece_ids.id_range().context(PieceEmbeddingsSnafu)?;
        let n_pieces = self.n_pieces;

        ensure!(
            min >= 0,
            PieceIdOutOfRangeSnafu {
                piece_id: min,
                n_pieces
            }
        );
        ensure!(
            (max as u64) < n_pieces as u64,
            PieceIdOutOfRangeSnafu {
                piece_id: max,
                n_pieces
            }
        );

        Ok(())
    }
}
