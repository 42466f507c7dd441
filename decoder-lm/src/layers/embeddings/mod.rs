/// Embedding layers.
mod sinusoidal;
pub use sinusoidal::{SinusoidalPositions, SinusoidalPositionsError};
