use crate::utils::{norm_cdf, norm_pdf};
use crate::{check_candidates, AcquisitionResult, Result};
use gpal_gp::Surrogate;
use ndarray::ArrayView2;

const SIGMA_FLOOR: f64 = 1e-12;

/// Expected improvement of one candidate over `best`, in the requested
/// direction. Degenerates to the clamped improvement when the predictive
/// standard deviation vanishes.
pub fn ei_score(mean: f64, std: f64, best: f64, maximize: bool) -> f64 {
    let improvement = if maximize { mean - best } else { best - mean };
    if std < SIGMA_FLOOR {
        return improvement.max(0.0);
    }
    let u = improvement / std;
    improvement * norm_cdf(u) + std * norm_pdf(u)
}

/// Expected Improvement over a candidate set against the best observed
/// training target.
pub fn ei(
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
        .map(|(&m, &v)| ei_score(m, v.sqrt(), best, maximize))
        .collect();
    Ok(AcquisitionResult::new(scores))
}
