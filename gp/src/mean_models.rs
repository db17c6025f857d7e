use crate::priors::{HyperSpec, ParamSet, Prior};
use ndarray::{Array1, ArrayView2};

/// A structured prior mean for the GP.
///
/// This is the seam where domain knowledge enters the model: a deterministic
/// function of the inputs and a named parameter set, with a prior declared
/// per parameter. The parameters are inferred jointly with the kernel
/// hyperparameters; neither the kernel nor the sampler is ever modified to
/// accommodate a mean function.
pub trait MeanModel: Send + Sync {
    /// Mean value at each row of `x` under the given parameters.
    fn mean(&self, x: &ArrayView2<f64>, params: &ParamSet) -> Array1<f64>;

    /// Declared parameters and their priors; empty for parameter-free means.
    fn hyperparameters(&self) -> Vec<HyperSpec> {
        Vec::new()
    }
}

/// Constant mean with a prior on its level, parameter `m_const`.
pub struct ConstantMean {
    prior: Prior,
}

impl ConstantMean {
    pub fn new(prior: Prior) -> Self {
        ConstantMean { prior }
    }
}

impl MeanModel for ConstantMean {
    fn mean(&self, x: &ArrayView2<f64>, params: &ParamSet) -> Array1<f64> {
        let c = params.scalar("m_const").unwrap_or(0.0);
        Array1::from_elem(x.nrows(), c)
    }

    fn hyperparameters(&self) -> Vec<HyperSpec> {
        vec![HyperSpec::scalar("m_const", self.prior.clone())]
    }
}

/// Adapter turning a closure plus parameter declarations into a [MeanModel].
pub struct FnMean<F>
where
    F: Fn(&ArrayView2<f64>, &ParamSet) -> Array1<f64> + Send + Sync,
{
    f: F,
    specs: Vec<HyperSpec>,
}

impl<F> FnMean<F>
where
    F: Fn(&ArrayView2<f64>, &ParamSet) -> Array1<f64> + Send + Sync,
{
    pub fn new(specs: Vec<HyperSpec>, f: F) -> Self {
        FnMean { f, specs }
    }
}

impl<F> MeanModel for FnMean<F>
where
    F: Fn(&ArrayView2<f64>, &ParamSet) -> Array1<f64> + Send + Sync,
{
    fn mean(&self, x: &ArrayView2<f64>, params: &ParamSet) -> Array1<f64> {
        (self.f)(x, params)
    }

    fn hyperparameters(&self) -> Vec<HyperSpec> {
        self.specs.clone()
    }
}
