use crate::{check_candidates, AcquisitionResult, Result};
use gpal_gp::Surrogate;
use ndarray::ArrayView2;

/// Default exploration weight
pub const DEFAULT_KAPPA: f64 = 2.0;

/// Confidence-bound score of one candidate: the upper bound
/// `mean + kappa * std` when maximizing, the lower bound
/// `mean - kappa * std` when minimizing (select with `argmin` then).
pub fn ucb_score(mean: f64, std: f64, kappa: f64, maximize: bool) -> f64 {
    if maximize {
        mean + kappa * std
    } else {
        mean - kappa * std
    }
}

/// Upper/Lower Confidence Bound over a candidate set.
pub fn ucb(
    seed: u64,
    model: &dyn Surrogate,
    candidates: &ArrayView2<f64>,
    kappa: f64,
    maximize: bool,
) -> Result<AcquisitionResult> {
    check_candidates(model, candidates)?;
    let (mean, var) = model.predict_moments(seed, candidates)?;
    let scores = mean
        .iter()
        .zip(var.iter())
        .map(|(&m, &v)| ucb_score(m, v.sqrt(), kappa, maximize))
        .collect();
    Ok(AcquisitionResult::new(scores))
}
