use gpal_gp::GpError;
use thiserror::Error;

/// A result type for deep kernel learning algorithms
pub type Result<T> = std::result::Result<T, DklError>;

/// An error when fitting or evaluating a deep kernel model
#[derive(Error, Debug)]
pub enum DklError {
    /// When input/output shapes are inconsistent with each other or with the model
    #[error("Invalid shape: {0}")]
    InvalidShape(String),
    /// When a configuration value is invalid
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    /// When the requested kernel family is not usable on an embedding
    #[error("Unsupported kernel: {0}")]
    UnsupportedKernel(String),
    /// When prediction is requested before any fit
    #[error("Model has not been fitted yet")]
    NotFitted,
    /// When the underlying GP computation fails
    #[error(transparent)]
    Gp(#[from] GpError),
    /// When a tensor computation fails
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl From<DklError> for GpError {
    fn from(err: DklError) -> GpError {
        match err {
            DklError::Gp(e) => e,
            DklError::InvalidShape(msg) => GpError::InvalidShape(msg),
            DklError::Tensor(e) => GpError::NumericalInstability(format!("tensor backend: {e}")),
            other => GpError::InvalidValue(other.to_string()),
        }
    }
}
