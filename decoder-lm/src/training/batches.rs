//! Batches for next-piece prediction.

use candle_core::{Device, Tensor};
use rand_core::{RngCore, SeedableRng};
use rand_pcg::Pcg32;
use snafu::{ensure, ResultExt, Snafu};

/// Errors for next-piece batches.
#[derive(Debug, Snafu)]
pub enum BatchError {
    #[snafu(display("Cannot create batch tensor"))]
    BatchTensor { source: candle_core::Error },

    #[snafu(display("Batch size must be at least 1"))]
    EmptyBatch,

    #[snafu(display("Sequence length must be at least 1"))]
    EmptySequence,
}

/// Model inputs with their next-piece targets.
#[derive(Clone, Debug)]
pub struct Batch {
    /// Input piece identifiers.
    ///
    /// *Shape:* `(batch_size, seq_len)`
    pub inputs: Tensor,

    /// The piece that follows each input piece.
    ///
    /// *Shape:* `(batch_size, seq_len)`
    pub targets: Tensor,
}

/// Splits a stream of piece identifiers into batches.
///
/// The stream is cut into windows of `seq_len + 1` pieces that start every
/// `seq_len` pieces. The first `seq_len` pieces of a window are the inputs,
/// the last `seq_len` pieces are the targets. Windows that do not fill a
/// complete batch are dropped.
pub struct NextTokenBatches {
    batch_size: usize,
    device: Device,
    piece_ids: Vec<u32>,
    seq_len: usize,
}

impl NextTokenBatches {
    /// Create batches from a piece identifier stream.
    ///
    /// * `piece_ids` - Piece identifiers of the whole corpus.
    /// * `batch_size` - Number of windows per batch.
    /// * `seq_len` - Number of input pieces per window.
    /// * `device` - Device on which batches are allocated.
    pub fn new(
        piece_ids: Vec<u32>,
        batch_size: usize,
        seq_len: usize,
        device: &Device,
    ) -> Result<Self, BatchError> {
        ensure!(batch_size > 0, EmptyBatchSnafu);
        ensure!(seq_len > 0, EmptySequenceSnafu);

        Ok(Self {
            batch_size,
            device: device.clone(),
            piece_ids,
            seq_len,
        })
    }

    /// Number of windows in the stream.
    pub fn n_windows(&self) -> usize {
        self.piece_ids.len().saturating_sub(1) / self.seq_len
    }

    /// Number of complete batches.
    pub fn len(&self) -> usize {
        self.n_windows() / self.batch_size
    }

    /// Whether there is no complete batch.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the batches in stream order.
    pub fn iter(&self) -> impl Iterator<Item = Result<Batch, BatchError>> + '_ {
        let order: Vec<_> = (0..self.n_windows()).collect();
        self.batches_in_order(order)
    }

    /// Iterate over the batches with windows in a seeded random order.
    ///
    /// * `seed` - Seed of the shuffle, the same seed gives the same order.
    pub fn shuffled(&self, seed: u64) -> impl Iterator<Item = Result<Batch, BatchError>> + '_ {
        let mut order: Vec<_> = (0..self.n_windows()).collect();
        let mut rng = Pcg32::seed_from_u64(seed);

        // Fisher-Yates.
        for i in (1..order.len()).rev() {
            let j = (rng.next_u64() % (i as u64 + 1)) as usize;
            order.swap(i, j);
        }

        self.batches_in_order(order)
    }

    fn batches_in_order(
        &self,
        order: Vec<usize>,
    ) -> impl Iterator<Item = Result<Batch, BatchError>> + '_ {
        let n_batches = self.len();
        (0..n_batches).map(move |batch_idx| {
            let windows = &order[batch_idx * self.batch_size..(batch_idx + 1) * self.batch_size];
            self.batch(windows)
        })
    }

    fn batch(&self, windows: &[usize]) -> Result<Batch, BatchError> {
        let mut inputs = Vec::with_capacity(windows.len() * self.seq_len);
        let mut targets = Vec::with_capacity(windows.len() * self.seq_len);
        for &window in windows {
            let start = window * self.seq_len;
            inputs.extend_from_slice(&self.piece_ids[start..start + self.seq_len]);
            targets.extend_from_slice(&self.piece_ids[start + 1..start + self.seq_len + 1]);
        }

        let shape = (windows.len(), self.seq_len);
        Ok(Batch {
            inputs: Tensor::from_vec(inputs, shape, &self.device).context(BatchTensorSnafu)?,
            targets: Tensor::from_vec(targets, shape, &self.device).context(BatchTensorSnafu)?,
        })
    }
}
