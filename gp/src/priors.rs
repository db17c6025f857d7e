use crate::errors::{GpError, Result};
use ndarray::Array1;
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::StandardNormal;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub(crate) const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Prior distribution over a scalar hyperparameter.
///
/// Every non-fixed prior comes with a deterministic bijection to an
/// unconstrained space so that all of them can be sampled by the same
/// gradient-based MCMC transition kernel: `Normal` uses the identity,
/// `LogNormal`/`HalfNormal` a log transform and `Uniform` a logit transform.
/// `Fixed` parameters are excluded from sampling altogether.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Prior {
    Normal { loc: f64, scale: f64 },
    LogNormal { loc: f64, scale: f64 },
    HalfNormal { scale: f64 },
    Uniform { lo: f64, hi: f64 },
    Fixed(f64),
}

impl Prior {
    /// Draw one value in the constrained (natural) space.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            Prior::Normal { loc, scale } => {
                let z: f64 = rng.sample(StandardNormal);
                loc + scale * z
            }
            Prior::LogNormal { loc, scale } => {
                let z: f64 = rng.sample(StandardNormal);
                (loc + scale * z).exp()
            }
            Prior::HalfNormal { scale } => {
                let z: f64 = rng.sample(StandardNormal);
                scale * z.abs()
            }
            Prior::Uniform { lo, hi } => lo + (hi - lo) * rng.gen::<f64>(),
            Prior::Fixed(v) => v,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, Prior::Fixed(_))
    }

    /// Map an unconstrained value to the constrained space.
    pub fn constrain(&self, z: f64) -> f64 {
        match *self {
            Prior::Normal { .. } => z,
            Prior::LogNormal { .. } | Prior::HalfNormal { .. } => z.exp(),
            Prior::Uniform { lo, hi } => lo + (hi - lo) * sigmoid(z),
            Prior::Fixed(v) => v,
        }
    }

    /// Map a constrained value to the unconstrained space.
    pub fn unconstrain(&self, x: f64) -> f64 {
        match *self {
            Prior::Normal { .. } => x,
            Prior::LogNormal { .. } | Prior::HalfNormal { .. } => x.ln(),
            Prior::Uniform { lo, hi } => {
                let u = ((x - lo) / (hi - lo)).clamp(1e-12, 1.0 - 1e-12);
                (u / (1.0 - u)).ln()
            }
            Prior::Fixed(_) => 0.0,
        }
    }

    /// Log density of the unconstrained variable, Jacobian included.
    pub fn log_prob_unconstrained(&self, z: f64) -> f64 {
        match *self {
            // log N(z; loc, scale)
            Prior::Normal { loc, scale } | Prior::LogNormal { loc, scale } => {
                let u = (z - loc) / scale;
                -0.5 * u * u - scale.ln() - 0.5 * LN_2PI
            }
            // x = e^z, x ~ HalfNormal(scale): log p(x) + z
            Prior::HalfNormal { scale } => {
                let x = z.exp();
                0.5 * (2.0 / std::f64::consts::PI).ln() - scale.ln()
                    - 0.5 * (x / scale) * (x / scale)
                    + z
            }
            // constant density times the sigmoid Jacobian
            Prior::Uniform { .. } => log_sigmoid(z) + log_sigmoid(-z),
            Prior::Fixed(_) => 0.0,
        }
    }

    /// Check the prior is well formed.
    pub fn validate(&self) -> Result<()> {
        let ok = match *self {
            Prior::Normal { scale, .. } | Prior::LogNormal { scale, .. } => scale > 0.0,
            Prior::HalfNormal { scale } => scale > 0.0,
            Prior::Uniform { lo, hi } => lo < hi,
            Prior::Fixed(v) => v.is_finite(),
        };
        if ok {
            Ok(())
        } else {
            Err(GpError::InvalidValue(format!("ill-formed prior {self:?}")))
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn log_sigmoid(z: f64) -> f64 {
    if z < 0.0 {
        z - z.exp().ln_1p()
    } else {
        -(-z).exp().ln_1p()
    }
}

/// Declaration of one named hyperparameter: its size and its prior,
/// shared by every component of a vector-valued parameter.
#[derive(Clone, Debug)]
pub struct HyperSpec {
    pub name: String,
    pub size: usize,
    pub prior: Prior,
}

impl HyperSpec {
    pub fn new(name: impl Into<String>, size: usize, prior: Prior) -> Self {
        HyperSpec {
            name: name.into(),
            size,
            prior,
        }
    }

    pub fn scalar(name: impl Into<String>, prior: Prior) -> Self {
        Self::new(name, 1, prior)
    }

    pub(crate) fn prefixed(&self, prefix: &str) -> Self {
        Self::new(format!("{prefix}{}", self.name), self.size, self.prior.clone())
    }
}

/// An ordered mapping from hyperparameter name to value vector; the single
/// currency for kernel, mean-function and noise parameter values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamSet {
    values: BTreeMap<String, Array1<f64>>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Array1<f64>) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Result<&Array1<f64>> {
        self.values
            .get(name)
            .ok_or_else(|| GpError::InvalidValue(format!("missing parameter '{name}'")))
    }

    pub fn scalar(&self, name: &str) -> Result<f64> {
        let v = self.get(name)?;
        if v.len() != 1 {
            return Err(GpError::InvalidShape(format!(
                "parameter '{name}' has {} components, expected a scalar",
                v.len()
            )));
        }
        Ok(v[0])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sub-set of parameters under `prefix`, with the prefix stripped.
    /// Used by composite kernels to route parameters to their operands.
    pub fn scoped(&self, prefix: &str) -> ParamSet {
        let values = self
            .values
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .map(|stripped| (stripped.to_string(), v.clone()))
            })
            .collect();
        ParamSet { values }
    }
}

impl FromIterator<(String, Array1<f64>)> for ParamSet {
    fn from_iter<T: IntoIterator<Item = (String, Array1<f64>)>>(iter: T) -> Self {
        ParamSet {
            values: iter.into_iter().collect(),
        }
    }
}
