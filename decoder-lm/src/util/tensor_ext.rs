//! Tensor extension traits.

use candle_core::{DType, Tensor, D};
use half::{bf16, f16};

/// Get a tensor with the data types minimum value.
pub trait MinLike: Sized {
    /// Get a new tensor with the data type's minimum value.
    ///
    /// The tensor has the same shape as `self`.
    fn min_like(&self) -> Result<Self, candle_core::Error>;
}

impl MinLike for Tensor {
    fn min_like(&self) -> Result<Self, candle_core::Error> {
        match self.dtype() {
            DType::BF16 => Tensor::try_from(bf16::MIN),
            DType::F16 => Tensor::try_from(f16::MIN),
            DType::F32 => Tensor::try_from(f32::MIN),
            DType::F64 => Tensor::try_from(f64::MIN),
            DType::U8 => Tensor::try_from(u8::MIN),
            DType::U32 => Tensor::try_from(u32::MIN),
            DType::I64 => Tensor::try_from(i64::MIN),
        }
        .and_then(|scalar| scalar.broadcast_as(self.shape()))
        .and_then(|tensor| tensor.to_device(self.device()))
    }
}

/// Range of the values in an integer tensor.
pub trait IdRange {
    /// Get the smallest and largest value of the tensor.
    ///
    /// The values are converted to `i64`, so that both unsigned and signed
    /// piece identifiers can be checked against a vocabulary. Fails on
    /// empty tensors.
    fn id_range(&self) -> Result<(i64, i64), candle_core::Error>;
}

impl IdRange for Tensor {
    fn id_range(&self) -> Result<(i64, i64), candle_core::Error> {
        let flat = self.flatten_all()?.to_dtype(DType::I64)?;
        let min = flat.min(D::Minus1)?.to_scalar::<i64>()?;
        let max = flat.max(D::Minus1)?.to_scalar::<i64>()?;
        Ok((min, max))
    }
}

/// Check whether all elements of a float tensor are finite.
pub trait AllFinite {
    fn all_finite(&self) -> Result<bool, candle_core::Error>;
}

impl AllFinite for Tensor {
    fn all_finite(&self) -> Result<bool, candle_core::Error> {
        Ok(self
            .flatten_all()?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?
            .iter()
            .all(|v| v.is_finite()))
    }
}
