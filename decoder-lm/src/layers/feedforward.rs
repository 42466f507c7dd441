/// Feed-forward layers.
use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_module::BuildModule;

/// Point-wise feed-forward layer configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointwiseFeedForwardConfig {
    activation: Activation,
    hidden_width: usize,
    intermediate_width: usize,
}

impl PointwiseFeedForwardConfig {
    /// Activation function.
    ///
    /// Default: `Activation::Relu`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Hidden width, dimensionality of the layer input and output.
    ///
    /// Default: `64`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Intermediate width inside the feed-forward layer.
    ///
    /// Default: `256`
    pub fn intermediate_width(mut self, intermediate_width: usize) -> Self {
        self.intermediate_width = intermediate_width;
        self
    }
}

impl Default for PointwiseFeedForwardConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Relu,
            hidden_width: 64,
            intermediate_width: 256,
        }
    }
}

impl BuildModule for PointwiseFeedForwardConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(PointwiseFeedForward::new(vb, self)?))
    }
}

/// Errors for point-wise feed-forward layers.
#[derive(Debug, Snafu)]
pub enum PointwiseFeedForwardError {
    #[snafu(display("Cannot build activation"))]
    BuildActivation { source: BoxedError },

    #[snafu(display("Cannot construct layer"))]
    Construction { source: candle_core::Error },
}

/// Point-wise feed-forward layer (_Vaswani et al., 2017_).
///
/// This layer is applied pointwise, meaning that the same
/// transformation is applied to each sequence element. This
/// transformation is:
///
/// `g(xW_1 + b_1)W_2 + b_2`
///
/// `W_1` and `b_1` transform the input to an
/// intermediate width, `g` is a non-linear activation
/// function and `W_2` and `b_2` transform the
/// output of the activation back to the input width.
///
/// * _Vaswani et al., 2017_: https://arxiv.org/abs/1706.03762
pub struct PointwiseFeedForward {
    activation: Box<dyn ModuleT>,
    intermediate: Linear,
    output: Linear,
}

impl PointwiseFeedForward {
    /// Construct a point-wise feed-forward layer.
    ///
    /// * `vb` - Variable store.
    /// * `config` - Layer configuration.
    pub fn new(
        vb: VarBuilder,
        config: &PointwiseFeedForwardConfig,
    ) -> Result<Self, PointwiseFeedForwardError> {
        let intermediate = linear(
            config.hidden_width,
            config.intermediate_width,
            vb.push_prefix("intermediate"),
        )
        .context(ConstructionSnafu)?;

        let output = linear(
            config.intermediate_width,
            config.hidden_width,
            vb.push_prefix("output"),
        )
        .context(ConstructionSnafu)?;

        Ok(Self {
            activation: config
                .activation
                .build(vb.push_prefix("activation"))
                .context(BuildActivationSnafu)?,
            intermediate,
            output,
        })
    }
}

impl ModuleT for PointwiseFeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        let hidden = self
            .activation
            .forward_t(&self.intermediate.forward(xs)?, train)?;
        self.output.forward(&hidden)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, ModuleT, Tensor};
    use candle_nn::VarBuilder;
    use snafu::{report, ResultExt, Whatever};

    use super::{PointwiseFeedForward, PointwiseFeedForwardConfig};
    use crate::util::tests::{assert_tensor_eq, PseudoRandom, SeededVars};

    #[test]
    #[report]
    fn feedforward_preserves_shape() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let vars = SeededVars::new(&device);
        let ffn = PointwiseFeedForward::new(
            vars.vb(),
            &PointwiseFeedForwardConfig::default()
                .hidden_width(8)
                .intermediate_width(32),
        )
        .whatever_context("Cannot construct feed-forward layer")?;
        vars.init(3)?;

        let input = Tensor::pseudo_random(&[2, 5, 8], &device);
        let output = ffn
            .forward_t(&input, false)
            .whatever_context("Cannot apply feed-forward layer")?;
        assert_eq!(output.dims(), &[2, 5, 8]);

        Ok(())
    }

    #[test]
    #[report]
    fn feedforward_with_zero_parameters_outputs_zeros() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let ffn = PointwiseFeedForward::new(
            VarBuilder::zeros(DType::F32, &device),
            &PointwiseFeedForwardConfig::default()
                .hidden_width(4)
                .intermediate_width(8),
        )
        .whatever_context("Cannot construct feed-forward layer")?;

        let input = Tensor::pseudo_random(&[1, 3, 4], &device);
        let output = ffn
            .forward_t(&input, false)
            .whatever_context("Cannot apply feed-forward layer")?;

        assert_tensor_eq!(
            &output,
            output.zeros_like().whatever_context("Cannot create zeros")?,
            epsilon = 0f32,
        );

        Ok(())
    }
}
