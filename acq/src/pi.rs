use crate::utils::norm_cdf;
use crate::{check_candidates, AcquisitionResult, Result};
use gpal_gp::Surrogate;
use ndarray::ArrayView2;

const SIGMA_FLOOR: f64 = 1e-12;

/// Probability that one candidate improves over `best` in the requested
/// direction; a 0/1 indicator when the standard deviation vanishes.
pub fn pi_score(mean: f64, std: f64, best: f64, maximize: bool) -> f64 {
    let improvement = if maximize { mean - best } else { best - mean };
    if std < SIGMA_FLOOR {
        return if improvement > 0.0 { 1.0 } else { 0.0 };
    }
    norm_cdf(improvement / std)
}

/// Probability of Improvement over a candidate set against the best
/// observed training target.
pub fn pi(
    seed: u64,
    model: &dyn Surrogate,
    candidates: &ArrayView2<f64>,
    maximize: bool,
) -> Result<AcquisitionResult> {
    check_candidates(model, candidates)?;
    let best = model.best_observed(maximize);
    let (mean, var) = model.predict_moments(seed, candidates)?;
    let scores = mean
        .iter()
        .zip(var.iter())
        .map(|(&m, &v)| pi_score(m, v.sqrt(), best, maximize))
        .collect();
    Ok(AcquisitionResult::new(scores))
}
