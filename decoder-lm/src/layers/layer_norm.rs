use candle_core::ModuleT;
use candle_nn::{layer_norm, LayerNormConfig as CandleLayerNormConfig, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Layer norm configuration.
///
/// Normalizes the last (feature) axis to zero mean and unit variance,
/// followed by a learned per-feature scale and bias when `affine` is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerNormConfig {
    pub affine: bool,
    pub eps: f64,
    pub size: usize,
}

impl LayerNormConfig {
    /// Whether to use an affine transformation.
    ///
    /// Default: `true`
    pub fn affine(mut self, affine: bool) -> Self {
        self.affine = affine;
        self
    }

    /// Epsilon value.
    ///
    /// Default: `1e-5`
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Dimensionality of the layer.
    ///
    /// Default: `64`
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

impl Default for LayerNormConfig {
    fn default() -> Self {
        Self {
            affine: true,
            eps: 1e-5,
            size: 64,
        }
    }
}

impl BuildModule for LayerNormConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(layer_norm(
            self.size,
            CandleLayerNormConfig {
                affine: self.affine,
                eps: self.eps,
                remove_mean: true,
            },
            vb,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor, D};
    use snafu::{report, FromString, ResultExt, Whatever};

    use super::LayerNormConfig;
    use crate::layers::build_module::BuildModule;
    use crate::util::tests::{PseudoRandom, SeededVars};

    #[test]
    #[report]
    fn layer_norm_normalizes_features() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let vars = SeededVars::new(&device);
        let norm = LayerNormConfig::default()
            .size(8)
            .build(vars.vb())
            .map_err(|e| Whatever::with_source(e, "Cannot build layer norm".to_string()))?;

        let input = (Tensor::pseudo_random(&[2, 3, 8], &device) * 5.)
            .whatever_context("Cannot scale input")?;
        let output = norm
            .forward_t(&input, false)
            .whatever_context("Cannot apply layer norm")?;

        let mean = output
            .mean(D::Minus1)
            .and_then(|xs| xs.flatten_all())
            .and_then(|xs| xs.to_vec1::<f32>())
            .whatever_context("Cannot compute mean")?;
        let var = output
            .sqr()
            .and_then(|xs| xs.mean(D::Minus1))
            .and_then(|xs| xs.flatten_all())
            .and_then(|xs| xs.to_vec1::<f32>())
            .whatever_context("Cannot compute variance")?;

        assert!(mean.iter().all(|m| m.abs() < 1e-5));
        assert!(var.iter().all(|v| (v - 1.).abs() < 1e-3));

        Ok(())
    }
}
