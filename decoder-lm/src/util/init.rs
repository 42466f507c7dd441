//! Seeded parameter initialization.

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use rand_core::{RngCore, SeedableRng};
use rand_pcg::Pcg32;
use snafu::{ResultExt, Snafu};

/// Errors for parameter initialization.
#[derive(Debug, Snafu)]
pub enum InitError {
    #[snafu(display("Cannot create initial value for parameter '{name}'"))]
    CreateValue {
        name: String,
        source: candle_core::Error,
    },

    #[snafu(display("Parameter store lock is poisoned"))]
    PoisonedLock,

    #[snafu(display("Cannot set value of parameter '{name}'"))]
    SetValue {
        name: String,
        source: candle_core::Error,
    },
}

/// Draw a uniform number in `[-1, 1)`.
///
/// Only the mantissa bits of the 32-bit draw are used for the magnitude,
/// the least significant bit picks the sign. This keeps the values stable
/// across `rand` releases.
fn symmetric_uniform(rng: &mut Pcg32) -> f32 {
    let next = rng.next_u32();
    let mantissa_bits_shift = u32::BITS - f32::MANTISSA_DIGITS;
    let zero_one = (next >> mantissa_bits_shift) as f32 / (1 << f32::MANTISSA_DIGITS) as f32;
    if next & 1 == 1 {
        -zero_one
    } else {
        zero_one
    }
}

/// How a single parameter is initialized.
enum ParamInit {
    /// Keep the value the layer was built with (normalization scale/bias).
    Keep,

    /// All zeros (linear biases).
    Zeros,

    /// Uniform in `[-bound, bound)`.
    Uniform { bound: f32 },
}

impl ParamInit {
    fn for_parameter(name: &str, var: &Var) -> Self {
        let dims = var.dims();
        if name.contains("layer_norm") {
            ParamInit::Keep
        } else if dims.len() == 1 {
            ParamInit::Zeros
        } else if name.contains("piece_embeddings") {
            // Unit variance, like a standard normal embedding table.
            ParamInit::Uniform {
                bound: 3f32.sqrt(),
            }
        } else {
            let fan_in = dims[dims.len() - 1].max(1);
            ParamInit::Uniform {
                bound: 1. / (fan_in as f32).sqrt(),
            }
        }
    }
}

/// Deterministically (re)initialize all parameters in a variable map.
///
/// Candle initializes variables from the device RNG when a layer is built.
/// This function overwrites every variable with values drawn from a PCG32
/// generator seeded with `seed`. Variables are visited in name order, so the
/// same model configuration and seed always produce the same parameters.
///
/// * Linear and embedding matrices are drawn uniformly, scaled by their
///   fan-in (embeddings get unit variance).
/// * Linear biases are set to zero.
/// * Layer normalization parameters are left untouched (ones/zeros).
pub fn init_parameters(varmap: &VarMap, seed: u64) -> Result<(), InitError> {
    let data = varmap.data().lock().map_err(|_| InitError::PoisonedLock)?;

    let mut names = data.keys().cloned().collect::<Vec<_>>();
    names.sort();

    let mut rng = Pcg32::seed_from_u64(seed);

    for name in names {
        let var = &data[&name];
        let value = match ParamInit::for_parameter(&name, var) {
            ParamInit::Keep => continue,
            ParamInit::Zeros => var.zeros_like(),
            ParamInit::Uniform { bound } => {
                let values = (0..var.elem_count())
                    .map(|_| symmetric_uniform(&mut rng) * bound)
                    .collect::<Vec<_>>();
                Tensor::from_vec(values, var.shape(), var.device())
                    .and_then(|xs| xs.to_dtype(var.dtype()))
            }
        }
        .context(CreateValueSnafu { name: name.clone() })?;

        var.set(&value).context(SetValueSnafu { name })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::{layer_norm, linear, LayerNormConfig, VarBuilder, VarMap};
    use snafu::{report, ResultExt, Whatever};

    use super::init_parameters;

    fn build_varmap() -> Result<VarMap, Whatever> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        linear(4, 3, vb.push_prefix("proj")).whatever_context("Cannot build linear")?;
        layer_norm(3, LayerNormConfig::default(), vb.push_prefix("layer_norm"))
            .whatever_context("Cannot build layer norm")?;
        Ok(varmap)
    }

    fn values(varmap: &VarMap, name: &str) -> Result<Vec<f32>, Whatever> {
        let data = varmap.data().lock().expect("Poisoned lock");
        data[name]
            .flatten_all()
            .and_then(|xs| xs.to_vec1::<f32>())
            .whatever_context("Cannot read parameter")
    }

    #[test]
    #[report]
    fn init_parameters_is_deterministic() -> Result<(), Whatever> {
        let first = build_varmap()?;
        let second = build_varmap()?;
        init_parameters(&first, 42).whatever_context("Cannot init")?;
        init_parameters(&second, 42).whatever_context("Cannot init")?;

        assert_eq!(
            values(&first, "proj.weight")?,
            values(&second, "proj.weight")?
        );

        let third = build_varmap()?;
        init_parameters(&third, 43).whatever_context("Cannot init")?;
        assert_ne!(
            values(&first, "proj.weight")?,
            values(&third, "proj.weight")?
        );

        Ok(())
    }

    #[test]
    #[report]
    fn init_parameters_respects_parameter_kinds() -> Result<(), Whatever> {
        let varmap = build_varmap()?;
        init_parameters(&varmap, 7).whatever_context("Cannot init")?;

        let bound = 1. / 4f32.sqrt();
        assert!(values(&varmap, "proj.weight")?
            .iter()
            .all(|v| v.abs() <= bound));
        assert!(values(&varmap, "proj.bias")?.iter().all(|&v| v == 0.));
        assert!(values(&varmap, "layer_norm.weight")?
            .iter()
            .all(|&v| v == 1.));
        assert!(values(&varmap, "layer_norm.bias")?
            .iter()
            .all(|&v| v == 0.));

        Ok(())
    }
}
