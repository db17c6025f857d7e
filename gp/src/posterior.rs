use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::priors::ParamSet;
use linfa_linalg::cholesky::*;
use linfa_linalg::triangular::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;

/// Lower Cholesky factor of `k` with an escalating diagonal jitter.
///
/// The jitter starts at `jitter` and is multiplied by 10 on each failed
/// attempt, up to `retries` escalations; the decomposition failure is then
/// surfaced as a [GpError::NumericalInstability], never suppressed.
pub fn cholesky_with_jitter(
    k: &Array2<f64>,
    jitter: f64,
    retries: usize,
) -> Result<(Array2<f64>, f64)> {
    let mut j = jitter;
    for _ in 0..=retries {
        let mut kj = k.to_owned();
        kj.diag_mut().iter_mut().for_each(|v| *v += j);
        if let Ok(l) = kj.cholesky() {
            return Ok((l, j));
        }
        j *= 10.0;
    }
    Err(GpError::NumericalInstability(format!(
        "covariance not positive definite after {retries} jitter escalations \
         (last jitter {:.1e})",
        j / 10.0
    )))
}

/// Exact multivariate-normal conditioning of a zero-mean GP on observed
/// residuals. Callers with a structured prior mean subtract it from the
/// targets beforehand and add it back to [Conditioned::mean] at the query
/// points.
#[derive(Clone, Debug)]
pub struct Conditioned {
    /// Posterior mean at the query points
    pub mean: Array1<f64>,
    /// Posterior covariance at the query points
    pub cov: Array2<f64>,
}

impl Conditioned {
    /// Marginal posterior variances, clamped at zero: the diagonal may go
    /// slightly negative depending on machine precision.
    pub fn variances(&self) -> Array1<f64> {
        self.cov.diag().mapv(|v| v.max(0.0))
    }
}

/// Standard GP conditioning:
/// mean = K(X*, X) K(X, X)^-1 r,
/// cov  = K(X*, X*) - K(X*, X) K(X, X)^-1 K(X, X*),
/// with `noise` added on the diagonal of both K(X, X) and K(X*, X*).
pub fn conditional(
    kernel: &Kernel,
    params: &ParamSet,
    noise: f64,
    xtrain: &ArrayView2<f64>,
    residual: &ArrayView1<f64>,
    xnew: &ArrayView2<f64>,
    jitter: f64,
    retries: usize,
) -> Result<Conditioned> {
    let n = xtrain.nrows();
    if residual.len() != n {
        return Err(GpError::InvalidShape(format!(
            "residual length {} does not match {} training points",
            residual.len(),
            n
        )));
    }

    let mut kxx = kernel.covariance(xtrain, xtrain, params)?;
    kxx.diag_mut().iter_mut().for_each(|v| *v += noise);
    let (l, _) = cholesky_with_jitter(&kxx, jitter, retries)?;

    // alpha = K(X, X)^-1 r via two triangular solves
    let r = residual.to_owned().insert_axis(Axis(1));
    let w = l.solve_triangular(&r, UPLO::Lower)?;
    let alpha = l.t().to_owned().solve_triangular(&w, UPLO::Upper)?;

    let ksx = kernel.covariance(xnew, xtrain, params)?;
    let mean = ksx.dot(&alpha).index_axis(Axis(1), 0).to_owned();

    let mut kss = kernel.covariance(xnew, xnew, params)?;
    kss.diag_mut().iter_mut().for_each(|v| *v += noise);
    // v = L^-1 K(X, X*), cov = K(X*, X*) - v^T v
    let v = l.solve_triangular(&ksx.t().to_owned(), UPLO::Lower)?;
    let cov = kss - v.t().dot(&v);

    Ok(Conditioned { mean, cov })
}

/// One draw from N(mean, cov), reproducible for a given generator state.
pub fn sample_mvn(
    rng: &mut Xoshiro256Plus,
    mean: &Array1<f64>,
    cov: &Array2<f64>,
    jitter: f64,
    retries: usize,
) -> Result<Array1<f64>> {
    let (l, _) = cholesky_with_jitter(cov, jitter, retries)?;
    let z: Array1<f64> = Array1::random_using(mean.len(), StandardNormal, rng);
    Ok(mean + &l.dot(&z))
}
