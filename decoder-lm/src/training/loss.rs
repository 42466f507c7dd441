//! Next-token prediction objective.

use candle_core::{DType, Tensor};
use candle_nn::loss::cross_entropy;
use snafu::{ensure, ResultExt, Snafu};

use crate::util::tensor_ext::IdRange;

/// Errors for the next-token objective.
#[derive(Debug, Snafu)]
pub enum LossError {
    #[snafu(display("Cannot compute cross-entropy"))]
    CrossEntropy { source: candle_core::Error },

    #[snafu(display("Logits must have shape (batch_size, seq_len, n_pieces)"))]
    InvalidLogits { source: candle_core::Error },

    #[snafu(display("Piece identifiers must have shape (batch_size, seq_len)"))]
    InvalidPieceIds { source: candle_core::Error },

    #[snafu(display("Cannot check target range"))]
    TargetRange { source: candle_core::Error },

    #[snafu(display(
        "Logits of shape {logits:?} do not match targets of shape {targets:?}"
    ))]
    ShapeMismatch {
        logits: Vec<usize>,
        targets: Vec<usize>,
    },

    #[snafu(display("Cannot shift piece identifiers"))]
    Shift { source: candle_core::Error },

    #[snafu(display("Target {piece_id} is not in the vocabulary of {n_pieces} pieces"))]
    TargetOutOfRange { piece_id: i64, n_pieces: usize },

    #[snafu(display("Need at least two pieces to predict a next piece, got {seq_len}"))]
    TooShort { seq_len: usize },
}

/// Mean cross-entropy of next-piece predictions.
///
/// The loss is averaged over all positions of all sequences in the batch.
///
/// * `logits` - Unnormalized next-piece scores.
///   *Shape:* `(batch_size, seq_len, n_pieces)`
/// * `targets` - Piece that follows each position.
///   *Shape:* `(batch_size, seq_len)`
///
/// Returns: Scalar loss tensor.
pub fn next_token_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor, LossError> {
    let (batch_size, seq_len, n_pieces) = logits.dims3().context(InvalidLogitsSnafu)?;
    let target_dims = targets.dims();
    ensure!(
        target_dims == [batch_size, seq_len].as_slice(),
        ShapeMismatchSnafu {
            logits: logits.dims().to_vec(),
            targets: target_dims.to_vec(),
        }
    );

    let (min, max) = targets.id_range().context(TargetRangeSnafu)?;
    ensure!(
        min >= 0,
        TargetOutOfRangeSnafu {
            piece_id: min,
            n_pieces
        }
    );
    ensure!(
        (max as u64) < n_pieces as u64,
        TargetOutOfRangeSnafu {
            piece_id: max,
            n_pieces
        }
    );

    let logits = logits
        .reshape((batch_size * seq_len, n_pieces))
        .context(CrossEntropySnafu)?;
    let targets = targets
        .flatten_all()
        .and_then(|xs| xs.to_dtype(DType::U32))
        .context(CrossEntropySnafu)?;

    cross_entropy(&logits, &targets).context(CrossEntropySnafu)
}

/// Split piece identifiers into model inputs and next-piece targets.
///
/// * `piece_ids` - Piece identifiers.
///   *Shape:* `(batch_size, seq_len)`
///
/// Returns: `(piece_ids[:, :-1], piece_ids[:, 1:])`.
pub fn shift_for_next_token(piece_ids: &Tensor) -> Result<(Tensor, Tensor), LossError> {
    let (_, seq_len) = piece_ids.dims2().context(InvalidPieceIdsSnafu)?;
    ensure!(seq_len >= 2, TooShortSnafu { seq_len });

    let inputs = piece_ids
        .narrow(1, 0, seq_len - 1)
        .context(ShiftSnafu)?;
    let targets = piece_ids
        .narrow(1, 1, seq_len - 1)
        .context(ShiftSnafu)?;

    Ok((inputs, targets))
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use snafu::{report, ResultExt, Whatever};

    use super::{next_token_loss, shift_for_next_token, LossError};
    use crate::util::tests::PseudoRandom;

    #[test]
    #[report]
    fn next_token_loss_of_uniform_logits_is_log_vocab() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 3, 8), DType::F32, &device)
            .whatever_context("Cannot create logits")?;
        let targets = Tensor::new(&[[0u32, 3, 7], [1, 1, 5]], &device)
            .whatever_context("Cannot create targets")?;

        let loss = next_token_loss(&logits, &targets)
            .whatever_context("Cannot compute loss")?
            .to_scalar::<f32>()
            .whatever_context("Cannot read loss")?;

        assert!((loss - 8f32.ln()).abs() < 1e-5, "loss: {loss}");

        Ok(())
    }

    #[test]
    #[report]
    fn next_token_loss_rewards_correct_predictions() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let targets =
            Tensor::new(&[[2u32, 0]], &device).whatever_context("Cannot create targets")?;
        let confident = Tensor::new(&[[[0f32, 0., 10.], [10., 0., 0.]]], &device)
            .whatever_context("Cannot create logits")?;
        let wrong = Tensor::new(&[[[10f32, 0., 0.], [0., 10., 0.]]], &device)
            .whatever_context("Cannot create logits")?;

        let confident_loss = next_token_loss(&confident, &targets)
            .whatever_context("Cannot compute loss")?
            .to_scalar::<f32>()
            .whatever_context("Cannot read loss")?;
        let wrong_loss = next_token_loss(&wrong, &targets)
            .whatever_context("Cannot compute loss")?
            .to_scalar::<f32>()
            .whatever_context("Cannot read loss")?;

        assert!(confident_loss < 1e-3);
        assert!(wrong_loss > 5.);

        Ok(())
    }

    #[test]
    fn next_token_loss_rejects_shape_mismatch() {
        let device = Device::Cpu;
        let logits = Tensor::pseudo_random(&[2, 4, 10], &device);
        let targets = Tensor::zeros((2, 3), DType::U32, &device).expect("Cannot create targets");

        assert!(matches!(
            next_token_loss(&logits, &targets),
            Err(LossError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn next_token_loss_rejects_targets_outside_vocabulary() {
        let device = Device::Cpu;
        let logits = Tensor::pseudo_random(&[1, 2, 10], &device);
        let targets = Tensor::new(&[[3u32, 10]], &device).expect("Cannot create targets");

        assert!(matches!(
            next_token_loss(&logits, &targets),
            Err(LossError::TargetOutOfRange {
                piece_id: 10,
                n_pieces: 10
            })
        ));
    }

    #[test]
    #[report]
    fn shift_for_next_token_offsets_targets() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let piece_ids = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 7, 8]], &device)
            .whatever_context("Cannot create piece ids")?;

        let (inputs, targets) =
            shift_for_next_token(&piece_ids).whatever_context("Cannot shift piece ids")?;

        assert_eq!(
            inputs
                .to_vec2::<u32>()
                .whatever_context("Cannot read inputs")?,
            vec![vec![1, 2, 3], vec![5, 6, 7]]
        );
        assert_eq!(
            targets
                .to_vec2::<u32>()
                .whatever_context("Cannot read targets")?,
            vec![vec![2, 3, 4], vec![6, 7, 8]]
        );

        Ok(())
    }

    #[test]
    fn shift_for_next_token_rejects_single_piece() {
        let piece_ids = Tensor::new(&[[1u32]], &Device::Cpu).expect("Cannot create piece ids");
        assert!(matches!(
            shift_for_next_token(&piece_ids),
            Err(LossError::TooShort { seq_len: 1 })
        ));
    }
}
