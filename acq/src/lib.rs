//! Acquisition scoring for active learning: turn a trained surrogate's
//! predictive mean/variance over candidate inputs into a scalar utility per
//! candidate, ranking which input is most valuable to measure next.
//!
//! Criteria: [ucb] (confidence bound), [ei] (expected improvement) and
//! [pi] (probability of improvement), each available both as a pure score
//! function of (mean, std, best, maximize) and as a driver over any
//! [gpal_gp::Surrogate]. Selection is deterministic: ties break on the
//! first occurrence.
mod ei;
mod errors;
mod pi;
mod ucb;
mod utils;

pub use ei::{ei, ei_score};
pub use errors::*;
pub use pi::{pi, pi_score};
pub use ucb::{ucb, ucb_score, DEFAULT_KAPPA};
pub use utils::{norm_cdf, norm_pdf};

use gpal_gp::Surrogate;
use ndarray::{Array1, ArrayView2};

/// One scalar score per candidate input; higher means more valuable to
/// measure next (for the lower confidence bound, select with [argmin](Self::argmin)).
#[derive(Clone, Debug)]
pub struct AcquisitionResult {
    scores: Array1<f64>,
}

impl AcquisitionResult {
    pub(crate) fn new(scores: Array1<f64>) -> Self {
        AcquisitionResult { scores }
    }

    pub fn scores(&self) -> &Array1<f64> {
        &self.scores
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Index of the highest score; ties resolve to the first occurrence.
    pub fn argmax(&self) -> Option<usize> {
        self.select(|candidate, best| candidate > best)
    }

    /// Index of the lowest score; ties resolve to the first occurrence.
    pub fn argmin(&self) -> Option<usize> {
        self.select(|candidate, best| candidate < best)
    }

    fn select(&self, better: impl Fn(f64, f64) -> bool) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, &v) in self.scores.iter().enumerate() {
            match best {
                None => best = Some((i, v)),
                Some((_, b)) if better(v, b) => best = Some((i, v)),
                _ => {}
            }
        }
        best.map(|(i, _)| i)
    }
}

pub(crate) fn check_candidates(
    model: &dyn Surrogate,
    candidates: &ArrayView2<f64>,
) -> Result<()> {
    if candidates.ncols() != model.input_dim() {
        return Err(AcqError::InvalidShape(format!(
            "candidates have dimension {}, model expects {}",
            candidates.ncols(),
            model.input_dim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpal_gp::{ExactGp, Kernel, McmcConfig, Prior, Result as GpResult};
    use ndarray::array;

    struct StubModel {
        mean: Array1<f64>,
        var: Array1<f64>,
        best: f64,
    }

    impl Surrogate for StubModel {
        fn input_dim(&self) -> usize {
            1
        }

        fn predict_moments(
            &self,
            _seed: u64,
            _x: &ArrayView2<f64>,
        ) -> GpResult<(Array1<f64>, Array1<f64>)> {
            Ok((self.mean.clone(), self.var.clone()))
        }

        fn best_observed(&self, _maximize: bool) -> f64 {
            self.best
        }
    }

    #[test]
    fn test_tie_breaks_on_first_occurrence() {
        let result = AcquisitionResult::new(array![1.0, 3.0, 3.0, 0.5, 3.0]);
        assert_eq!(result.argmax(), Some(1));
        let result = AcquisitionResult::new(array![2.0, 0.1, 0.1]);
        assert_eq!(result.argmin(), Some(1));
        assert_eq!(AcquisitionResult::new(array![]).argmax(), None);
    }

    #[test]
    fn test_ucb_prefers_uncertain_when_means_tie() {
        let model = StubModel {
            mean: array![1.0, 1.0, 1.0],
            var: array![0.1, 2.0, 0.5],
            best: 1.0,
        };
        let cands = array![[0.0], [1.0], [2.0]];
        let result = ucb(0, &model, &cands.view(), DEFAULT_KAPPA, true).unwrap();
        assert_eq!(result.argmax(), Some(1));
        // lower confidence bound for minimization, selected via argmin
        let result = ucb(0, &model, &cands.view(), DEFAULT_KAPPA, false).unwrap();
        assert_eq!(result.argmin(), Some(1));
    }

    #[test]
    fn test_ei_pi_rank_clear_improvement_first(){
        let model = StubModel {
            mean: array![0.0, 2.0, 1.0],
            var: array![0.5, 0.5, 0.5],
            best: 1.0,
        };
        let cands = array![[0.0], [1.0], [2.0]];
        let result = ei(0, &model, &cands.view(), true).unwrap();
        assert_eq!(result.argmax(), Some(1));
        let result = pi(0, &model, &cands.view(), true).unwrap();
        assert_eq!(result.argmax(), Some(1));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let model = StubModel {
            mean: array![0.0],
            var: array![1.0],
            best: 0.0,
        };
        let cands = array![[0.0, 1.0]];
        assert!(matches!(
            ucb(0, &model, &cands.view(), 1.0, true),
            Err(AcqError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_end_to_end_with_exact_gp() {
        // the GP is most uncertain far from its training points, so UCB
        // must rank the distant candidate first
        let x = array![[0.0], [0.5], [1.0]];
        let y = array![0.0, 0.25, 1.0];
        let gp = ExactGp::params(Kernel::Rbf, 1)
            .noise_prior(Prior::Fixed(1e-4))
            .fit(
                0,
                &x.view(),
                &y.view(),
                &McmcConfig {
                    num_chains: 1,
                    num_warmup: 60,
                    num_samples: 60,
                },
            )
            .unwrap();
        let cands = array![[0.25], [0.75], [3.0]];
        let result = ucb(1, &gp, &cands.view(), DEFAULT_KAPPA, true).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result.argmax(), Some(2));
    }
}
