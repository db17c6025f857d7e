//! Covariance families evaluated in tensor space, keyed by the shared
//! [Kernel] enum, so the same family tag drives both the trainable
//! deep-kernel path and the exact-conditioning path.

use crate::errors::{DklError, Result};
use candle_core::Tensor;
use candle_nn::init::Init;
use candle_nn::VarBuilder;
use gpal_gp::Kernel;

/// Trainable kernel hyperparameters in log space. Their priors are standard
/// normal on the logs (log-normal in the natural space), which the training
/// objective accounts for through its prior term.
pub struct KernelVars {
    pub log_length: Tensor,
    pub log_scale: Tensor,
    pub log_noise: Tensor,
    /// `log_period` for Periodic, `log_alpha` for RationalQuadratic
    pub log_extra: Option<Tensor>,
}

impl KernelVars {
    pub fn new(kind: &Kernel, embedding_dim: usize, vb: VarBuilder) -> Result<KernelVars> {
        let log_extra = match kind {
            Kernel::Periodic => Some(vb.get_with_hints(1, "log_period", Init::Const(0.0))?),
            Kernel::RationalQuadratic => {
                Some(vb.get_with_hints(1, "log_alpha", Init::Const(0.0))?)
            }
            Kernel::Rbf | Kernel::Matern52 => None,
            other => {
                return Err(DklError::UnsupportedKernel(format!(
                    "{other:?} cannot drive a deep kernel; use a base family"
                )))
            }
        };
        Ok(KernelVars {
            log_length: vb.get_with_hints(embedding_dim, "log_length", Init::Const(0.0))?,
            log_scale: vb.get_with_hints(1, "log_scale", Init::Const(0.0))?,
            log_noise: vb.get_with_hints(1, "log_noise", Init::Const(0.0))?,
            log_extra,
        })
    }

    /// Sum of squared logs, the negative log prior up to a constant.
    pub fn neg_log_prior(&self) -> Result<Tensor> {
        let mut acc = self.log_length.sqr()?.sum_all()?;
        acc = (acc + self.log_scale.sqr()?.sum_all()?)?;
        acc = (acc + self.log_noise.sqr()?.sum_all()?)?;
        if let Some(extra) = &self.log_extra {
            acc = (acc + extra.sqr()?.sum_all()?)?;
        }
        Ok(acc.affine(0.5, 0.0)?)
    }
}

/// Cross-covariance matrix between two embedded batches, shape (n, m).
/// Observation noise is not included; callers add `noise + jitter` to the
/// diagonal before decomposing.
pub fn covariance(kind: &Kernel, vars: &KernelVars, z1: &Tensor, z2: &Tensor) -> Result<Tensor> {
    let scale = vars.log_scale.exp()?;
    match kind {
        Kernel::Rbf => {
            let r2 = scaled_sq_dist(z1, z2, &vars.log_length.exp()?)?;
            Ok(r2.affine(-0.5, 0.0)?.exp()?.broadcast_mul(&scale)?)
        }
        Kernel::Matern52 => {
            let r2 = scaled_sq_dist(z1, z2, &vars.log_length.exp()?)?;
            let r = r2.affine(1.0, 1e-12)?.sqrt()?;
            let t = r.affine(5f64.sqrt(), 0.0)?;
            let poly = (t.affine(1.0, 1.0)? + r2.affine(5.0 / 3.0, 0.0)?)?;
            let k = (poly * t.neg()?.exp()?)?;
            Ok(k.broadcast_mul(&scale)?)
        }
        Kernel::RationalQuadratic => {
            let r2 = scaled_sq_dist(z1, z2, &vars.log_length.exp()?)?;
            let alpha = vars
                .log_extra
                .as_ref()
                .ok_or_else(|| DklError::InvalidValue("missing log_alpha".to_string()))?
                .exp()?;
            let base = r2.broadcast_div(&alpha.affine(2.0, 0.0)?)?.affine(1.0, 1.0)?;
            let k = base
                .log()?
                .broadcast_mul(&alpha.affine(-1.0, 0.0)?)?
                .exp()?;
            Ok(k.broadcast_mul(&scale)?)
        }
        Kernel::Periodic => {
            let period = vars
                .log_extra
                .as_ref()
                .ok_or_else(|| DklError::InvalidValue("missing log_period".to_string()))?
                .exp()?;
            let length = vars.log_length.exp()?;
            let d = z1
                .unsqueeze(1)?
                .broadcast_sub(&z2.unsqueeze(0)?)?; // (n, m, k)
            let s = d
                .affine(std::f64::consts::PI, 0.0)?
                .broadcast_div(&period)?
                .sin()?
                .broadcast_div(&length)?
                .sqr()?
                .sum(2)?; // (n, m)
            Ok(s.affine(-2.0, 0.0)?.exp()?.broadcast_mul(&scale)?)
        }
        other => Err(DklError::UnsupportedKernel(format!(
            "{other:?} cannot drive a deep kernel; use a base family"
        ))),
    }
}

/// `|(z1_i - z2_j) / l|^2`, clipped at zero against cancellation.
fn scaled_sq_dist(z1: &Tensor, z2: &Tensor, length: &Tensor) -> Result<Tensor> {
    let s1 = z1.broadcast_div(length)?;
    let s2 = z2.broadcast_div(length)?;
    let n1 = s1.sqr()?.sum_keepdim(1)?; // (n, 1)
    let n2 = s2.sqr()?.sum_keepdim(1)?; // (m, 1)
    let cross = s1.matmul(&s2.t()?)?; // (n, m)
    let r2 = n1
        .broadcast_add(&n2.t()?)?
        .broadcast_sub(&cross.affine(2.0, 0.0)?)?;
    Ok(r2.relu()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn vars_for(kind: &Kernel, dim: usize) -> KernelVars {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &Device::Cpu);
        KernelVars::new(kind, dim, vb).unwrap()
    }

    #[test]
    fn test_rbf_matches_reference_values() {
        let device = Device::Cpu;
        let z = Tensor::from_vec(vec![0.0, 1.0, 2.0], (3, 1), &device).unwrap();
        let vars = vars_for(&Kernel::Rbf, 1);
        let k = covariance(&Kernel::Rbf, &vars, &z, &z).unwrap();
        let k = k.to_vec2::<f64>().unwrap();
        assert_abs_diff_eq!(k[0][0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(k[0][1], (-0.5f64).exp(), epsilon = 1e-12);
        assert_abs_diff_eq!(k[0][2], (-2.0f64).exp(), epsilon = 1e-12);
        assert_abs_diff_eq!(k[1][0], k[0][1], epsilon = 1e-12);
    }

    #[test]
    fn test_families_produce_symmetric_matrices() {
        let device = Device::Cpu;
        let z = Tensor::from_vec(
            vec![0.1, -0.3, 1.2, 0.7, 2.0, -1.5, 0.9, 0.9],
            (4, 2),
            &device,
        )
        .unwrap();
        for kind in [Kernel::Matern52, Kernel::RationalQuadratic, Kernel::Periodic] {
            let vars = vars_for(&kind, 2);
            let k = covariance(&kind, &vars, &z, &z).unwrap();
            let k = k.to_vec2::<f64>().unwrap();
            for i in 0..4 {
                for j in 0..4 {
                    assert!((k[i][j] - k[j][i]).abs() < 1e-10, "{kind:?} not symmetric");
                }
            }
        }
    }

    #[test]
    fn test_composite_rejected() {
        let composite = Kernel::Sum(Box::new(Kernel::Rbf), Box::new(Kernel::Matern52));
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &Device::Cpu);
        assert!(matches!(
            KernelVars::new(&composite, 2, vb),
            Err(DklError::UnsupportedKernel(_))
        ));
    }
}
