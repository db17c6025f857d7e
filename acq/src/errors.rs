use gpal_gp::GpError;
use thiserror::Error;

/// A result type for acquisition scoring
pub type Result<T> = std::result::Result<T, AcqError>;

/// An error when scoring candidate inputs
#[derive(Error, Debug)]
pub enum AcqError {
    /// When candidate shapes do not match the surrogate model
    #[error("Invalid shape: {0}")]
    InvalidShape(String),
    /// When the surrogate model fails to predict
    #[error(transparent)]
    Gp(#[from] GpError),
}
