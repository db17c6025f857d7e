//! Dense decompositions written in tensor ops so that gradients flow
//! through them: the GP marginal likelihood on the embedding needs a
//! Cholesky factor and triangular solves that back-propagate into the
//! extractor weights and the kernel hyperparameters.

use candle_core::{Result, Tensor};

/// Lower Cholesky factor of a symmetric positive-definite matrix,
/// column by column. Callers are responsible for conditioning the input
/// (noise/jitter on the diagonal); a non-PD input surfaces as NaN.
pub fn cholesky(a: &Tensor) -> Result<Tensor> {
    let (n, m) = a.dims2()?;
    if n != m {
        candle_core::bail!("cholesky expects a square matrix, got {n}x{m}");
    }
    let mut cols: Vec<Tensor> = Vec::with_capacity(n);
    for j in 0..n {
        let a_jj = a.narrow(0, j, 1)?.narrow(1, j, 1)?;
        let (d, off) = if j == 0 {
            let off = if j + 1 < n {
                Some(a.narrow(0, j + 1, n - j - 1)?.narrow(1, j, 1)?)
            } else {
                None
            };
            (a_jj, off)
        } else {
            // row j and the sub-diagonal block of the factor built so far
            let row: Vec<Tensor> = cols.iter().map(|c| c.narrow(0, j, 1)).collect::<Result<_>>()?;
            let row = Tensor::cat(&row, 1)?; // (1, j)
            let d = (a_jj - row.matmul(&row.t()?)?)?;
            let off = if j + 1 < n {
                let block: Vec<Tensor> = cols
                    .iter()
                    .map(|c| c.narrow(0, j + 1, n - j - 1))
                    .collect::<Result<_>>()?;
                let block = Tensor::cat(&block, 1)?; // (n-j-1, j)
                Some((a.narrow(0, j + 1, n - j - 1)?.narrow(1, j, 1)?
                    - block.matmul(&row.t()?)?)?)
            } else {
                None
            };
            (d, off)
        };
        let l_jj = d.sqrt()?;
        let mut parts: Vec<Tensor> = Vec::with_capacity(3);
        if j > 0 {
            parts.push(Tensor::zeros((j, 1), a.dtype(), a.device())?);
        }
        parts.push(l_jj.clone());
        if let Some(off) = off {
            parts.push(off.broadcast_div(&l_jj)?);
        }
        cols.push(Tensor::cat(&parts, 0)?);
    }
    Tensor::cat(&cols, 1)
}

/// Solve `L x = b` by forward substitution, `l` lower triangular,
/// `b` of shape (n, m).
pub fn solve_lower_triangular(l: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (n, _) = l.dims2()?;
    let mut rows: Vec<Tensor> = Vec::with_capacity(n);
    for i in 0..n {
        let bi = b.narrow(0, i, 1)?;
        let rhs = if i == 0 {
            bi
        } else {
            let li = l.narrow(0, i, 1)?.narrow(1, 0, i)?; // (1, i)
            let xs = Tensor::cat(&rows, 0)?; // (i, m)
            (bi - li.matmul(&xs)?)?
        };
        let l_ii = l.narrow(0, i, 1)?.narrow(1, i, 1)?;
        rows.push(rhs.broadcast_div(&l_ii)?);
    }
    Tensor::cat(&rows, 0)
}

/// Solve `U x = b` by backward substitution, `u` upper triangular.
pub fn solve_upper_triangular(u: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (n, _) = u.dims2()?;
    let mut rows_rev: Vec<Tensor> = Vec::with_capacity(n);
    for k in 0..n {
        let i = n - 1 - k;
        let bi = b.narrow(0, i, 1)?;
        let rhs = if k == 0 {
            bi
        } else {
            let ui = u.narrow(0, i, 1)?.narrow(1, i + 1, n - i - 1)?; // (1, n-i-1)
            let mut below: Vec<Tensor> = rows_rev.clone();
            below.reverse(); // rows i+1..n in order
            let xs = Tensor::cat(&below, 0)?;
            (bi - ui.matmul(&xs)?)?
        };
        let u_ii = u.narrow(0, i, 1)?.narrow(1, i, 1)?;
        rows_rev.push(rhs.broadcast_div(&u_ii)?);
    }
    rows_rev.reverse();
    Tensor::cat(&rows_rev, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn to_vec2(t: &Tensor) -> Vec<Vec<f64>> {
        t.to_vec2::<f64>().unwrap()
    }

    #[test]
    fn test_cholesky_reconstruction() {
        let device = Device::Cpu;
        let a = Tensor::from_vec(
            vec![4.0, 2.0, 0.6, 2.0, 5.0, 1.0, 0.6, 1.0, 3.0],
            (3, 3),
            &device,
        )
        .unwrap();
        let l = cholesky(&a).unwrap();
        let rec = l.matmul(&l.t().unwrap()).unwrap();
        let (a2, r2) = (to_vec2(&a), to_vec2(&rec));
        for i in 0..3 {
            for j in 0..3 {
                assert!((a2[i][j] - r2[i][j]).abs() < 1e-10, "mismatch at ({i},{j})");
            }
        }
        // strictly upper part of the factor must be zero
        let l2 = to_vec2(&l);
        assert_eq!(l2[0][1], 0.0);
        assert_eq!(l2[0][2], 0.0);
        assert_eq!(l2[1][2], 0.0);
    }

    #[test]
    fn test_triangular_solves() {
        let device = Device::Cpu;
        let a = Tensor::from_vec(
            vec![4.0, 2.0, 0.6, 2.0, 5.0, 1.0, 0.6, 1.0, 3.0],
            (3, 3),
            &device,
        )
        .unwrap();
        let b = Tensor::from_vec(vec![1.0, -2.0, 0.5], (3, 1), &device).unwrap();
        let l = cholesky(&a).unwrap();
        // x = A^-1 b via the two triangular solves
        let w = solve_lower_triangular(&l, &b).unwrap();
        let x = solve_upper_triangular(&l.t().unwrap(), &w).unwrap();
        let ax = a.matmul(&x).unwrap();
        let (b2, ax2) = (to_vec2(&b), to_vec2(&ax));
        for i in 0..3 {
            assert!((b2[i][0] - ax2[i][0]).abs() < 1e-10);
        }
    }

    #[test]
    fn test_gradient_flows_through_cholesky() {
        let device = Device::Cpu;
        let v = candle_core::Var::from_tensor(
            &Tensor::from_vec(vec![2.0f64], (1, 1), &device).unwrap(),
        )
        .unwrap();
        // A = [[v, 0], [0, 1]]; sum(diag(chol(A))) = sqrt(v) + 1
        let one = Tensor::from_vec(vec![1.0f64], (1, 1), &device).unwrap();
        let zero = Tensor::from_vec(vec![0.0f64], (1, 1), &device).unwrap();
        let top = Tensor::cat(&[v.as_tensor().clone(), zero.clone()], 1).unwrap();
        let bottom = Tensor::cat(&[zero, one], 1).unwrap();
        let a = Tensor::cat(&[top, bottom], 0).unwrap();
        let l = cholesky(&a).unwrap();
        let loss = l.narrow(0, 0, 1).unwrap().narrow(1, 0, 1).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let g = grads.get(v.as_tensor()).unwrap().to_vec2::<f64>().unwrap()[0][0];
        // d sqrt(v) / dv = 1 / (2 sqrt(v))
        assert!((g - 0.5 / 2f64.sqrt()).abs() < 1e-8, "gradient {g}");
    }
}
