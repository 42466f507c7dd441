use candle_core::{DType, Device, Tensor};
use snafu::{ensure, ResultExt, Snafu};

/// Errors for sinusoidal position encodings.
#[derive(Debug, Snafu)]
pub enum SinusoidalPositionsError {
    #[snafu(display("Cannot add position encodings to input"))]
    AddPositions { source: candle_core::Error },

    #[snafu(display("Cannot create position encoding table"))]
    Table { source: candle_core::Error },

    #[snafu(display("Invalid input rank, expected (batch_size, seq_len, width)"))]
    InvalidRank { source: candle_core::Error },

    #[snafu(display(
        "Sequence length {seq_len} exceeds the maximum sequence length {max_seq_len}"
    ))]
    SequenceTooLong { seq_len: usize, max_seq_len: usize },

    #[snafu(display("Input width {got} does not match position encoding width {expected}"))]
    WidthMismatch { expected: usize, got: usize },

    #[snafu(display("Position encoding width must be even, was {width}"))]
    WidthNotEven { width: usize },
}

/// Sinusoidal position encodings (_Vaswani et al., 2017_).
///
/// For position `pos` and each pair of dimensions `(2i, 2i + 1)`:
///
/// * `pe[pos, 2i] = sin(pos / base^(2i / width))`
/// * `pe[pos, 2i + 1] = cos(pos / base^(2i / width))`
///
/// The table is computed once for `max_seq_len` positions and has no
/// trainable parameters.
///
/// * _Vaswani et al., 2017_: https://arxiv.org/abs/1706.03762
#[derive(Debug)]
pub struct SinusoidalPositions {
    max_seq_len: usize,
    table: Tensor,
    width: usize,
}

impl SinusoidalPositions {
    /// Construct the position encoding table.
    ///
    /// * `width` - Width of the encodings, must be even.
    /// * `max_seq_len` - Number of positions to precompute.
    /// * `base` - The base of the wavelengths (normally 10_000).
    /// * `device` - Device on which the table is allocated.
    pub fn new(
        width: usize,
        max_seq_len: usize,
        base: usize,
        device: &Device,
    ) -> Result<Self, SinusoidalPositionsError> {
        ensure!(width % 2 == 0, WidthNotEvenSnafu { width });

        let table = Self::create_table(width, max_seq_len, base, device).context(TableSnafu)?;

        Ok(SinusoidalPositions {
            max_seq_len,
            table,
            width,
        })
    }

    fn create_table(
        width: usize,
        max_seq_len: usize,
        base: usize,
        device: &Device,
    ) -> Result<Tensor, candle_core::Error> {
        // Computed in f64 on the CPU, then converted and moved.
        let cpu = Device::Cpu;

        // 1 / base^(2i/d)
        let inv_freq: Vec<_> = (0..width)
            .step_by(2)
            .map(|i| (base as f64).powf(-(i as f64) / width as f64))
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, width / 2), &cpu)?;

        let position = Tensor::arange(0f64, max_seq_len as f64, &cpu)?.reshape((max_seq_len, 1))?;
        let angles = position.broadcast_mul(&inv_freq)?;

        // Interleave: [sin θ_0, cos θ_0, sin θ_1, cos θ_1, ...].
        Tensor::stack(&[&angles.sin()?, &angles.cos()?], 2)?
            .reshape((max_seq_len, width))?
            .to_dtype(DType::F32)?
            .to_device(device)
    }

    /// Maximum sequence length supported by the table.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// The precomputed table.
    ///
    /// *Shape:* `(max_seq_len, width)`
    pub fn table(&self) -> &Tensor {
        &self.table
    }

    /// Add the position encodings to the input.
    ///
    /// * `input` - Hidden representations.
    ///   *Shape:* `(batch_size, seq_len, width)`
    ///
    /// Returns: Input with position encodings added.
    /// *Shape:* `(batch_size, seq_len, width)`
    pub fn forward(&self, input: &Tensor) -> Result<Tensor, SinusoidalPositionsError> {
        let (_batch_size, seq_len, width) = input.dims3().context(InvalidRankSnafu)?;
        ensure!(
            seq_len <= self.max_seq_len,
            SequenceTooLongSnafu {
                seq_len,
                max_seq_len: self.max_seq_len
            }
        );
        ensure!(
            width == self.width,
            WidthMismatchSnafu {
                expected: self.width,
                got: width
            }
        );

        self.table
            .narrow(0, 0, seq_len)
            .and_then(|positions| positions.to_dtype(input.dtype()))
            .and_then(|positions| input.broadcast_add(&positions))
            .context(AddPositionsSnafu)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};
    use ndarray::array;
    use snafu::{report, ResultExt, Whatever};

    use super::{SinusoidalPositions, SinusoidalPositionsError};
    use crate::util::device::tests::test_devices;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    #[report]
    fn sinusoidal_positions_table_values() -> Result<(), Whatever> {
        for device in test_devices() {
            let positions = SinusoidalPositions::new(4, 3, 10_000, &device)
                .whatever_context("Cannot construct positions")?;

            // Second dimension pair has frequency 1 / 10000^(2/4) = 0.01.
            assert_tensor_eq!(
                positions.table(),
                array![
                    [0.0f32, 1.0, 0.0, 1.0],
                    [0.841_470_96, 0.540_302_3, 0.009_999_833, 0.999_95],
                    [0.909_297_4, -0.416_146_84, 0.019_998_667, 0.999_800_0]
                ],
                epsilon = 1e-6,
            );
        }

        Ok(())
    }

    #[test]
    #[report]
    fn sinusoidal_positions_first_row_is_sin_cos_of_zero() -> Result<(), Whatever> {
        let positions = SinusoidalPositions::new(64, 50, 10_000, &Device::Cpu)
            .whatever_context("Cannot construct positions")?;
        let first = positions
            .table()
            .get(0)
            .and_then(|row| row.to_vec1::<f32>())
            .whatever_context("Cannot get first row")?;

        for (dim, value) in first.iter().enumerate() {
            let expected = if dim % 2 == 0 { 0. } else { 1. };
            assert_eq!(*value, expected, "pe[0, {dim}]");
        }

        Ok(())
    }

    #[test]
    #[report]
    fn sinusoidal_positions_are_deterministic() -> Result<(), Whatever> {
        let first = SinusoidalPositions::new(64, 50, 10_000, &Device::Cpu)
            .whatever_context("Cannot construct positions")?;
        let second = SinusoidalPositions::new(64, 50, 10_000, &Device::Cpu)
            .whatever_context("Cannot construct positions")?;

        let first = first
            .table()
            .flatten_all()
            .and_then(|xs| xs.to_vec1::<f32>())
            .whatever_context("Cannot read table")?;
        let second = second
            .table()
            .flatten_all()
            .and_then(|xs| xs.to_vec1::<f32>())
            .whatever_context("Cannot read table")?;

        assert!(first
            .iter()
            .zip(second.iter())
            .all(|(a, b)| a.to_bits() == b.to_bits()));

        Ok(())
    }

    #[test]
    #[report]
    fn sinusoidal_positions_are_added_per_position() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let positions = SinusoidalPositions::new(4, 8, 10_000, &device)
            .whatever_context("Cannot construct positions")?;
        let input = Tensor::zeros((2, 3, 4), candle_core::DType::F32, &device)
            .whatever_context("Cannot create input")?;

        let output = positions
            .forward(&input)
            .whatever_context("Cannot add positions")?;

        for batch in 0..2 {
            assert_tensor_eq!(
                output.get(batch).whatever_context("Cannot index batch")?,
                positions
                    .table()
                    .narrow(0, 0, 3)
                    .whatever_context("Cannot slice table")?,
                epsilon = 0f32,
            );
        }

        Ok(())
    }

    #[test]
    fn sinusoidal_positions_reject_long_sequences() {
        let device = Device::Cpu;
        let positions =
            SinusoidalPositions::new(4, 50, 10_000, &device).expect("Cannot construct positions");
        let input = Tensor::zeros((1, 60, 4), candle_core::DType::F32, &device)
            .expect("Cannot create input");

        assert!(matches!(
            positions.forward(&input),
            Err(SinusoidalPositionsError::SequenceTooLong {
                seq_len: 60,
                max_seq_len: 50
            })
        ));
    }

    #[test]
    fn sinusoidal_positions_reject_odd_width() {
        assert!(matches!(
            SinusoidalPositions::new(5, 10, 10_000, &Device::Cpu),
            Err(SinusoidalPositionsError::WidthNotEven { width: 5 })
        ));
    }
}
