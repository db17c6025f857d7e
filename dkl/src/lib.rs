//! This library implements variational [deep kernel learning](https://arxiv.org/abs/1511.02222):
//! a trainable feature extractor maps raw inputs to a low-dimensional
//! embedding on which a standard GP kernel operates, and extractor weights
//! and kernel hyperparameters are optimized jointly by stochastic gradient
//! ascent on the evidence lower bound.
//!
//! The model is implemented by [ViDkl]; the extractor is any type
//! implementing the [FeatureExtractor] capability, with [MlpExtractor] as
//! the default. Trained models expose the same `Surrogate` prediction
//! contract as the exact GP, so the acquisition layer can consume either.
mod algorithm;
mod errors;
mod extractor;
pub mod kernels;
pub mod linalg;

pub use algorithm::ViDkl;
pub use errors::*;
pub use extractor::{FeatureExtractor, MlpExtractor};
