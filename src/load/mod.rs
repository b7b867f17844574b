//! Load estimation and load-aware budgets.

mod adaptive;
mod sampler;

pub use adaptive::{multiplier_for, AdaptiveBudgetCalculator, AdaptiveStatus};
pub use sampler::{LoadSample, LoadSampler, LoadSource, StaticLoad};
