use std::fmt::Debug;

use candle_core::ModuleT;
use candle_nn::VarBuilder;

use crate::error::BoxedError;

/// Traits for types that can build modules.
///
/// Implemented by the configurations of the interchangeable parts of a
/// transformer block (normalization, dropout, activation), so that a block
/// configuration can hold any of them.
pub trait BuildModule: Debug {
    /// Build a module.
    ///
    /// * `vb` - Variable builder for the parameters of the module.
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError>;
}
