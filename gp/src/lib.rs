//! This library implements fully-Bayesian [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process)
//! regression: a joint prior over kernel hyperparameters, observation noise
//! and (optionally) the parameters of a structured prior mean function is
//! sampled with Hamiltonian Monte Carlo, and predictions are exact
//! multivariate-normal conditionals computed per retained posterior draw.
//!
//! The model is implemented by [ExactGp] parameterized by [ExactGpParams].
//! Covariance families live in [kernels], prior-mean structures in
//! [mean_models] and hyperparameter priors in [priors]. Trained models
//! expose the [Surrogate] prediction contract consumed by the acquisition
//! layer.
mod algorithm;
mod errors;
pub mod kernels;
pub mod mean_models;
pub mod posterior;
pub mod priors;
mod sampler;
mod surrogate;

pub use algorithm::*;
pub use errors::*;
pub use kernels::Kernel;
pub use mean_models::{ConstantMean, FnMean, MeanModel};
pub use priors::{HyperSpec, ParamSet, Prior};
pub use sampler::{derive_seed, ChainStats, HmcSettings};
pub use surrogate::Surrogate;
