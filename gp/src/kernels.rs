use crate::errors::{GpError, Result};
use crate::priors::{HyperSpec, ParamSet, Prior};
use ndarray::{Array1, Array2, ArrayView2, Axis};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Closed set of supported covariance families.
///
/// Composition by `Sum`/`Product` keeps the calling contract unchanged:
/// operand hyperparameters are routed by an `a_`/`b_` name prefix so a
/// composite behaves exactly like a base kernel with a larger parameter set.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Kernel {
    /// Squared-exponential (radial basis function) kernel
    Rbf,
    /// Matern kernel with smoothness 5/2
    Matern52,
    /// Rational-quadratic kernel, a scale mixture of RBF kernels
    RationalQuadratic,
    /// Exponentiated-sine-squared kernel for periodic signals
    Periodic,
    /// Pointwise sum of two kernels
    Sum(Box<Kernel>, Box<Kernel>),
    /// Pointwise product of two kernels
    Product(Box<Kernel>, Box<Kernel>),
}

impl Kernel {
    /// Hyperparameters of this kernel for `input_dim`-dimensional inputs,
    /// with their default weakly-informative priors: one length-scale per
    /// dimension and a scalar signal variance, plus family extras.
    pub fn hyperparameters(&self, input_dim: usize) -> Vec<HyperSpec> {
        let lognormal = Prior::LogNormal { loc: 0.0, scale: 1.0 };
        match self {
            Kernel::Rbf | Kernel::Matern52 => vec![
                HyperSpec::new("k_length", input_dim, lognormal.clone()),
                HyperSpec::scalar("k_scale", lognormal),
            ],
            Kernel::RationalQuadratic => vec![
                HyperSpec::new("k_length", input_dim, lognormal.clone()),
                HyperSpec::scalar("k_scale", lognormal.clone()),
                HyperSpec::scalar("alpha", lognormal),
            ],
            Kernel::Periodic => vec![
                HyperSpec::new("k_length", input_dim, lognormal.clone()),
                HyperSpec::scalar("k_scale", lognormal.clone()),
                HyperSpec::scalar("period", lognormal),
            ],
            Kernel::Sum(a, b) | Kernel::Product(a, b) => {
                let mut specs: Vec<HyperSpec> = a
                    .hyperparameters(input_dim)
                    .iter()
                    .map(|s| s.prefixed("a_"))
                    .collect();
                specs.extend(b.hyperparameters(input_dim).iter().map(|s| s.prefixed("b_")));
                specs
            }
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Kernel::Sum(..) | Kernel::Product(..))
    }

    /// Cross-covariance matrix between two input sets, shape
    /// (x1.nrows(), x2.nrows()). Symmetric PSD when `x1 == x2`.
    ///
    /// No jitter is added here; callers add `noise + jitter` to the
    /// diagonal before any decomposition.
    pub fn covariance(
        &self,
        x1: &ArrayView2<f64>,
        x2: &ArrayView2<f64>,
        params: &ParamSet,
    ) -> Result<Array2<f64>> {
        if x1.ncols() != x2.ncols() {
            return Err(GpError::InvalidShape(format!(
                "input dimension mismatch: {} vs {}",
                x1.ncols(),
                x2.ncols()
            )));
        }
        match self {
            Kernel::Rbf => {
                let r2 = scaled_sq_distances(x1, x2, params.get("k_length")?)?;
                let scale = params.scalar("k_scale")?;
                Ok(r2.mapv(|v| scale * (-0.5 * v).exp()))
            }
            Kernel::Matern52 => {
                let r2 = scaled_sq_distances(x1, x2, params.get("k_length")?)?;
                let scale = params.scalar("k_scale")?;
                Ok(r2.mapv(|v| {
                    let r = (v + 1e-12).sqrt();
                    let t = 5f64.sqrt() * r;
                    scale * (1.0 + t + 5.0 / 3.0 * v) * (-t).exp()
                }))
            }
            Kernel::RationalQuadratic => {
                let r2 = scaled_sq_distances(x1, x2, params.get("k_length")?)?;
                let scale = params.scalar("k_scale")?;
                let alpha = params.scalar("alpha")?;
                Ok(r2.mapv(|v| scale * (1.0 + v / (2.0 * alpha)).powf(-alpha)))
            }
            Kernel::Periodic => {
                let length = params.get("k_length")?;
                check_length(length, x1.ncols())?;
                let scale = params.scalar("k_scale")?;
                let period = params.scalar("period")?;
                let mut k = Array2::zeros((x1.nrows(), x2.nrows()));
                for (i, xi) in x1.rows().into_iter().enumerate() {
                    for (j, xj) in x2.rows().into_iter().enumerate() {
                        let mut s = 0.0;
                        for (d, (a, b)) in xi.iter().zip(xj.iter()).enumerate() {
                            let l = if length.len() == 1 { length[0] } else { length[d] };
                            let w = (std::f64::consts::PI * (a - b) / period).sin() / l;
                            s += w * w;
                        }
                        k[[i, j]] = scale * (-2.0 * s).exp();
                    }
                }
                Ok(k)
            }
            Kernel::Sum(a, b) => {
                let ka = a.covariance(x1, x2, &params.scoped("a_"))?;
                let kb = b.covariance(x1, x2, &params.scoped("b_"))?;
                Ok(ka + kb)
            }
            Kernel::Product(a, b) => {
                let ka = a.covariance(x1, x2, &params.scoped("a_"))?;
                let kb = b.covariance(x1, x2, &params.scoped("b_"))?;
                Ok(ka * kb)
            }
        }
    }
}

fn check_length(length: &Array1<f64>, dim: usize) -> Result<()> {
    if length.len() != 1 && length.len() != dim {
        return Err(GpError::InvalidShape(format!(
            "length-scale has {} components, expected 1 or {dim}",
            length.len()
        )));
    }
    Ok(())
}

/// Squared scaled distances `|(x1_i - x2_j) / l|^2`, clipped at zero to
/// guard against cancellation for near-identical points.
fn scaled_sq_distances(
    x1: &ArrayView2<f64>,
    x2: &ArrayView2<f64>,
    length: &Array1<f64>,
) -> Result<Array2<f64>> {
    check_length(length, x1.ncols())?;
    let scale = |x: &ArrayView2<f64>| -> Array2<f64> {
        if length.len() == 1 {
            x.mapv(|v| v / length[0])
        } else {
            x / length
        }
    };
    let s1 = scale(x1);
    let s2 = scale(x2);
    let n1 = s1.mapv(|v| v * v).sum_axis(Axis(1));
    let n2 = s2.mapv(|v| v * v).sum_axis(Axis(1));
    let cross = s1.dot(&s2.t());
    let mut r2 = -2.0 * cross;
    for (i, &a) in n1.iter().enumerate() {
        for (j, &b) in n2.iter().enumerate() {
            r2[[i, j]] += a + b;
            if r2[[i, j]] < 0.0 {
                r2[[i, j]] = 0.0;
            }
        }
    }
    Ok(r2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use linfa_linalg::eigh::*;
    use ndarray::array;

    fn base_params(dim: usize) -> ParamSet {
        let mut params = ParamSet::new();
        params.insert("k_length", Array1::from_elem(dim, 1.0));
        params.insert("k_scale", array![1.0]);
        params.insert("alpha", array![2.0]);
        params.insert("period", array![1.5]);
        params
    }

    #[test]
    fn test_rbf_known_values() {
        let x = array![[0.0], [1.0], [2.0]];
        let k = Kernel::Rbf
            .covariance(&x.view(), &x.view(), &base_params(1))
            .unwrap();
        assert_abs_diff_eq!(k[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(k[[0, 1]], (-0.5f64).exp(), epsilon = 1e-12);
        assert_abs_diff_eq!(k[[0, 2]], (-2.0f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_symmetry_and_psd() {
        let x = array![
            [0.1, -0.3],
            [1.2, 0.7],
            [2.0, -1.5],
            [0.9, 0.9],
            [-0.4, 2.2]
        ];
        let kernels = [
            Kernel::Rbf,
            Kernel::Matern52,
            Kernel::RationalQuadratic,
            Kernel::Periodic,
        ];
        for kernel in &kernels {
            let k = kernel
                .covariance(&x.view(), &x.view(), &base_params(2))
                .unwrap();
            assert_abs_diff_eq!(k.clone(), k.t().to_owned(), epsilon = 1e-12);
            let (eigvals, _) = k.eigh().unwrap();
            for v in eigvals.iter() {
                assert!(*v >= -1e-8, "{kernel:?} eigenvalue {v} below tolerance");
            }
        }
    }

    #[test]
    fn test_composition_contract() {
        let x = array![[0.0], [0.5], [2.0]];
        let sum = Kernel::Sum(Box::new(Kernel::Rbf), Box::new(Kernel::Matern52));
        let mut params = ParamSet::new();
        for spec in sum.hyperparameters(1) {
            params.insert(spec.name.clone(), Array1::from_elem(spec.size, 1.0));
        }
        let ks = sum.covariance(&x.view(), &x.view(), &params).unwrap();
        let ka = Kernel::Rbf
            .covariance(&x.view(), &x.view(), &params.scoped("a_"))
            .unwrap();
        let kb = Kernel::Matern52
            .covariance(&x.view(), &x.view(), &params.scoped("b_"))
            .unwrap();
        assert_abs_diff_eq!(ks, ka + kb, epsilon = 1e-12);

        let prod = Kernel::Product(Box::new(Kernel::Rbf), Box::new(Kernel::Periodic));
        assert_eq!(prod.hyperparameters(1).len(), 5);
        assert!(prod.is_composite());
    }

    #[test]
    fn test_ard_length_scales() {
        // a huge length-scale on the second dimension makes it irrelevant
        let x1 = array![[0.0, 0.0]];
        let x2 = array![[0.0, 5.0]];
        let mut params = base_params(2);
        params.insert("k_length", array![1.0, 1e6]);
        let k = Kernel::Rbf
            .covariance(&x1.view(), &x2.view(), &params)
            .unwrap();
        assert_abs_diff_eq!(k[[0, 0]], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_dimension_mismatch() {
        let x1 = array![[0.0, 1.0]];
        let x2 = array![[0.0]];
        let res = Kernel::Rbf.covariance(&x1.view(), &x2.view(), &base_params(2));
        assert!(matches!(res, Err(GpError::InvalidShape(_))));
    }
}
