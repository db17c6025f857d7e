use crate::errors::Result;
use ndarray::{Array1, ArrayView2};

/// Prediction contract shared by every trained model the acquisition layer
/// can score: a predictive mean and variance per query point, plus the best
/// target value seen during training.
///
/// `seed` is threaded through so that surrogates whose predictive
/// distribution must be sampled stay reproducible; implementations with
/// closed-form moments are free to ignore it.
pub trait Surrogate {
    /// Input dimensionality expected by the model.
    fn input_dim(&self) -> usize;

    /// Predictive mean and variance at each row of `x`.
    fn predict_moments(&self, seed: u64, x: &ArrayView2<f64>)
        -> Result<(Array1<f64>, Array1<f64>)>;

    /// Best observed training target: maximum when maximizing, minimum
    /// otherwise.
    fn best_observed(&self, maximize: bool) -> f64;
}
