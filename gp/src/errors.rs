use linfa_linalg::LinalgError;
use thiserror::Error;

/// A result type for GP regression algorithms
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when fitting or evaluating a Gaussian process model
#[derive(Error, Debug)]
pub enum GpError {
    /// When input/output shapes are inconsistent with each other or with the model
    #[error("Invalid shape: {0}")]
    InvalidShape(String),
    /// When a covariance matrix cannot be decomposed even after jitter escalation
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),
    /// When too many MCMC transitions diverge
    #[error(
        "Inference divergence: {divergent}/{total} post-warmup transitions diverged \
         (rate {rate:.3} exceeds configured maximum {max_rate:.3})"
    )]
    InferenceDivergence {
        divergent: usize,
        total: usize,
        rate: f64,
        max_rate: f64,
    },
    /// When a configuration or parameter value is invalid
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    /// When linear algebra computation fails
    #[error("Linear algebra error")]
    Linalg(#[from] LinalgError),
}
