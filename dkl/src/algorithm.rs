use crate::errors::{DklError, Result};
use crate::extractor::{FeatureExtractor, MlpExtractor};
use crate::kernels::{covariance, KernelVars};
use crate::linalg::{cholesky, solve_lower_triangular};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, VarBuilder, VarMap};
use gpal_gp::posterior::{conditional, sample_mvn};
use gpal_gp::{derive_seed, GpError, Kernel, ParamSet, Surrogate};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_rand::rand::seq::index;
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256Plus;

const LN_2PI: f64 = 1.837_877_066_409_345_3;

struct Trained {
    x: Array2<f64>,
    y: Array1<f64>,
}

/// Variational deep kernel learning with a point-estimate (delta) guide:
/// extractor weights and log-space kernel hyperparameters are trained
/// jointly by stochastic gradient ascent on the evidence lower bound, which
/// for a Dirac variational family reduces to the GP marginal log likelihood
/// of the targets on the embedding plus the hyperparameter log prior.
///
/// Prediction embeds the query points and applies exact GP conditioning on
/// the embedding with the trained hyperparameters.
pub struct ViDkl<E: FeatureExtractor = MlpExtractor> {
    input_dim: usize,
    embedding_dim: usize,
    kernel: Kernel,
    device: Device,
    varmap: VarMap,
    extractor: E,
    kernel_vars: KernelVars,
    jitter: f64,
    max_jitter_retries: usize,
    trained: Option<Trained>,
    loss_trace: Vec<f64>,
}

impl ViDkl<MlpExtractor> {
    /// Deep kernel model with the default MLP extractor
    /// (hidden widths 64/32, tanh activations).
    pub fn new(input_dim: usize, embedding_dim: usize, kernel: Kernel) -> Result<Self> {
        Self::with_extractor(input_dim, embedding_dim, kernel, |vb| {
            MlpExtractor::new(input_dim, &MlpExtractor::DEFAULT_HIDDEN, embedding_dim, vb)
        })
    }
}

impl<E: FeatureExtractor> ViDkl<E> {
    /// Deep kernel model with a user-supplied extractor built on the model's
    /// variable store, so that its weights are trained along with the kernel.
    pub fn with_extractor<F>(
        input_dim: usize,
        embedding_dim: usize,
        kernel: Kernel,
        build: F,
    ) -> Result<Self>
    where
        F: FnOnce(VarBuilder<'static>) -> candle_core::Result<E>,
    {
        if input_dim == 0 || embedding_dim == 0 {
            return Err(DklError::InvalidValue(
                "input_dim and embedding_dim must be positive".to_string(),
            ));
        }
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
        let kernel_vars = KernelVars::new(&kernel, embedding_dim, vb.pp("kernel"))?;
        let extractor = build(vb.pp("feature_extractor"))?;
        if extractor.embedding_dim() != embedding_dim {
            return Err(DklError::InvalidShape(format!(
                "extractor embeds into dimension {}, model was declared with {}",
                extractor.embedding_dim(),
                embedding_dim
            )));
        }
        Ok(ViDkl {
            input_dim,
            embedding_dim,
            kernel,
            device,
            varmap,
            extractor,
            kernel_vars,
            jitter: 1e-6,
            max_jitter_retries: 3,
            trained: None,
            loss_trace: Vec::new(),
        })
    }

    /// Set the diagonal jitter used for decompositions.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Loss values recorded across all fit invocations. Non-convergence is
    /// not an error; this trace is the only signal callers get.
    pub fn loss_trace(&self) -> &[f64] {
        &self.loss_trace
    }

    fn check_inputs(&self, x: &ArrayView2<f64>, y: Option<&ArrayView1<f64>>) -> Result<()> {
        if x.ncols() != self.input_dim {
            return Err(DklError::InvalidShape(format!(
                "inputs have dimension {}, model was declared with {}",
                x.ncols(),
                self.input_dim
            )));
        }
        if let Some(y) = y {
            if y.len() != x.nrows() {
                return Err(DklError::InvalidShape(format!(
                    "{} input rows but {} targets",
                    x.nrows(),
                    y.len()
                )));
            }
        }
        Ok(())
    }

    /// Train extractor weights and kernel hyperparameters jointly for
    /// `num_steps` AdamW updates of size `step_size`, optionally on seeded
    /// minibatches of `batch_size` rows with likelihood rescaling.
    ///
    /// A first call initializes all variables deterministically from `seed`;
    /// subsequent calls warm-start from the current weights. Returns the
    /// per-step loss trace of this invocation; `num_steps` is the only stop
    /// condition.
    ///
    /// A failed fit leaves the model unusable for prediction rather than
    /// half-updated.
    pub fn fit(
        &mut self,
        seed: u64,
        x: &ArrayView2<f64>,
        y: &ArrayView1<f64>,
        num_steps: usize,
        step_size: f64,
        batch_size: Option<usize>,
    ) -> Result<Vec<f64>> {
        self.check_inputs(x, Some(y))?;
        let n = x.nrows();
        if n == 0 {
            return Err(DklError::InvalidShape("empty training set".to_string()));
        }
        if let Some(m) = batch_size {
            if m == 0 || m > n {
                return Err(DklError::InvalidValue(format!(
                    "batch_size {m} out of range for {n} training points"
                )));
            }
        }
        if !(step_size > 0.0) {
            return Err(DklError::InvalidValue("step_size must be positive".to_string()));
        }
        // past this point variables get mutated, so a failure must not leave
        // a half-updated model behind
        match self.fit_inner(seed, x, y, num_steps, step_size, batch_size) {
            Ok(losses) => Ok(losses),
            Err(e) => {
                self.trained = None;
                Err(e)
            }
        }
    }

    fn fit_inner(
        &mut self,
        seed: u64,
        x: &ArrayView2<f64>,
        y: &ArrayView1<f64>,
        num_steps: usize,
        step_size: f64,
        batch_size: Option<usize>,
    ) -> Result<Vec<f64>> {
        let n = x.nrows();
        if self.trained.is_none() {
            self.seed_variables(seed)?;
        }

        let x_all = Tensor::from_vec(x.iter().cloned().collect(), (n, self.input_dim), &self.device)?;
        let y_all = Tensor::from_vec(y.to_vec(), (n, 1), &self.device)?;

        let mut opt = AdamW::new_lr(self.varmap.all_vars(), step_size)?;
        let mut rng = Xoshiro256Plus::seed_from_u64(derive_seed(seed, 1));
        let mut losses = Vec::with_capacity(num_steps);

        for step in 0..num_steps {
            let (xb, yb, m) = match batch_size {
                Some(m) if m < n => {
                    let idx = index::sample(&mut rng, n, m).into_vec();
                    let mut xv = Vec::with_capacity(m * self.input_dim);
                    let mut yv = Vec::with_capacity(m);
                    for &i in &idx {
                        xv.extend(x.row(i).iter().cloned());
                        yv.push(y[i]);
                    }
                    (
                        Tensor::from_vec(xv, (m, self.input_dim), &self.device)?,
                        Tensor::from_vec(yv, (m, 1), &self.device)?,
                        m,
                    )
                }
                _ => (x_all.clone(), y_all.clone(), n),
            };

            let z = self.extractor.forward(&xb)?;
            let nll = self.gp_nll(&z, &yb)?;
            let loss = (nll.affine(n as f64 / m as f64, 0.0)?
                + self.kernel_vars.neg_log_prior()?)?;
            opt.backward_step(&loss)?;
            let value = loss.to_scalar::<f64>()?;
            losses.push(value);
            if (step + 1) % 100 == 0 {
                log::debug!("step {}/{num_steps}: loss {value:.6}", step + 1);
            }
        }

        log::info!(
            "deep kernel fitted on {n} points in {num_steps} steps, final loss {:?}",
            losses.last()
        );
        self.trained = Some(Trained {
            x: x.to_owned(),
            y: y.to_owned(),
        });
        self.loss_trace.extend_from_slice(&losses);
        Ok(losses)
    }

    // negative marginal log likelihood of y under the GP on the embedding
    fn gp_nll(&self, z: &Tensor, y: &Tensor) -> Result<Tensor> {
        let (m, k) = z.dims2()?;
        if k != self.embedding_dim {
            return Err(DklError::InvalidShape(format!(
                "extractor produced embedding dimension {k}, expected {}",
                self.embedding_dim
            )));
        }
        let cov = covariance(&self.kernel, &self.kernel_vars, z, z)?;
        let eye = Tensor::eye(m, DType::F64, &self.device)?;
        let diag = self.kernel_vars.log_noise.exp()?.affine(1.0, self.jitter)?;
        let kn = cov.broadcast_add(&eye.broadcast_mul(&diag)?)?;
        let l = cholesky(&kn)?;
        let w = solve_lower_triangular(&l, y)?;
        let quad = w.sqr()?.sum_all()?;
        let logdet_half = (&l * &eye)?.sum(1)?.log()?.sum_all()?;
        Ok((quad.affine(0.5, 0.5 * m as f64 * LN_2PI)? + logdet_half)?)
    }

    // deterministic variable initialization: scaled normal draws for weight
    // matrices, zeros for biases and log-space kernel parameters, in sorted
    // name order so that equal seeds give equal models
    fn seed_variables(&self, seed: u64) -> Result<()> {
        let data = self.varmap.data().lock().unwrap();
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        for name in &names {
            let var = &data[name];
            let dims = var.dims().to_vec();
            let count: usize = dims.iter().product();
            let values: Vec<f64> = if dims.len() >= 2 {
                let fan_in = dims[dims.len() - 1] as f64;
                let std = (1.0 / fan_in).sqrt();
                (0..count)
                    .map(|_| rng.sample::<f64, _>(StandardNormal) * std)
                    .collect()
            } else {
                vec![0.0; count]
            };
            var.set(&Tensor::from_vec(values, dims, &self.device)?)?;
        }
        Ok(())
    }

    /// Learned embedding of a batch of inputs.
    pub fn embed(&self, x: &ArrayView2<f64>) -> Result<Array2<f64>> {
        self.check_inputs(x, None)?;
        let n = x.nrows();
        let t = Tensor::from_vec(x.iter().cloned().collect(), (n, self.input_dim), &self.device)?;
        let z = self.extractor.forward(&t)?;
        let flat: Vec<f64> = z.to_vec2::<f64>()?.into_iter().flatten().collect();
        Array2::from_shape_vec((n, self.embedding_dim), flat)
            .map_err(|e| DklError::InvalidShape(e.to_string()))
    }

    fn kernel_param_set(&self) -> Result<(ParamSet, f64)> {
        let mut params = ParamSet::new();
        let length: Vec<f64> = self
            .kernel_vars
            .log_length
            .to_vec1::<f64>()?
            .into_iter()
            .map(f64::exp)
            .collect();
        params.insert("k_length", Array1::from_vec(length));
        params.insert(
            "k_scale",
            Array1::from_elem(1, self.kernel_vars.log_scale.to_vec1::<f64>()?[0].exp()),
        );
        if let Some(extra) = &self.kernel_vars.log_extra {
            let name = match self.kernel {
                Kernel::Periodic => "period",
                _ => "alpha",
            };
            params.insert(name, Array1::from_elem(1, extra.to_vec1::<f64>()?[0].exp()));
        }
        let noise = self.kernel_vars.log_noise.to_vec1::<f64>()?[0].exp();
        Ok((params, noise))
    }

    fn conditioned(
        &self,
        xnew: &ArrayView2<f64>,
    ) -> Result<gpal_gp::posterior::Conditioned> {
        let t = self.trained.as_ref().ok_or(DklError::NotFitted)?;
        self.check_inputs(xnew, None)?;
        let z_train = self.embed(&t.x.view())?;
        let z_new = self.embed(xnew)?;
        let (params, noise) = self.kernel_param_set()?;
        Ok(conditional(
            &self.kernel,
            &params,
            noise,
            &z_train.view(),
            &t.y.view(),
            &z_new.view(),
            self.jitter,
            self.max_jitter_retries,
        )?)
    }

    /// Predictive mean and variance at `xnew`: exact GP conditioning on the
    /// learned embedding with the trained hyperparameters. The seed is
    /// reserved for sampling-based predictors; the moments are closed-form.
    pub fn predict(
        &self,
        _seed: u64,
        xnew: &ArrayView2<f64>,
    ) -> Result<(Array1<f64>, Array1<f64>)> {
        let cond = self.conditioned(xnew)?;
        let var = cond.variances();
        Ok((cond.mean, var))
    }

    /// Draws from the predictive posterior at `xnew`, shape (n_draws, rows).
    pub fn sample_posterior(
        &self,
        seed: u64,
        xnew: &ArrayView2<f64>,
        n_draws: usize,
    ) -> Result<Array2<f64>> {
        let cond = self.conditioned(xnew)?;
        let mut draws = Array2::zeros((n_draws, xnew.nrows()));
        for i in 0..n_draws {
            let mut rng = Xoshiro256Plus::seed_from_u64(derive_seed(seed, i as u64));
            let sample = sample_mvn(
                &mut rng,
                &cond.mean,
                &cond.cov,
                self.jitter,
                self.max_jitter_retries,
            )?;
            draws.row_mut(i).assign(&sample);
        }
        Ok(draws)
    }
}

impl<E: FeatureExtractor> Surrogate for ViDkl<E> {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn predict_moments(
        &self,
        seed: u64,
        x: &ArrayView2<f64>,
    ) -> gpal_gp::Result<(Array1<f64>, Array1<f64>)> {
        self.predict(seed, x).map_err(GpError::from)
    }

    fn best_observed(&self, maximize: bool) -> f64 {
        match &self.trained {
            Some(t) => t.y.iter().copied().fold(
                if maximize { f64::NEG_INFINITY } else { f64::INFINITY },
                |acc, v| if maximize { acc.max(v) } else { acc.min(v) },
            ),
            None => f64::NAN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Axis};
    use ndarray_rand::rand::Rng;

    fn toy_data(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let x = Array2::from_shape_fn((n, 2), |_| rng.gen_range(-1.0..1.0));
        let y = x.map_axis(Axis(1), |row| 2.0 * row[0] - row[1]);
        (x, y)
    }

    fn pearson(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
        let (ma, mb) = (a.mean().unwrap(), b.mean().unwrap());
        let (mut num, mut da, mut db) = (0.0, 0.0, 0.0);
        for (x, y) in a.iter().zip(b.iter()) {
            num += (x - ma) * (y - mb);
            da += (x - ma) * (x - ma);
            db += (y - mb) * (y - mb);
        }
        num / (da.sqrt() * db.sqrt())
    }

    #[test]
    fn test_fit_records_losses() {
        let (x, y) = toy_data(16, 0);
        let mut m = ViDkl::new(2, 1, Kernel::Rbf).unwrap();
        let losses = m.fit(0, &x.view(), &y.view(), 40, 0.05, None).unwrap();
        assert_eq!(losses.len(), 40);
        assert!(losses.iter().all(|v| v.is_finite()));
        let (mean, var) = m.predict(0, &x.view()).unwrap();
        assert_eq!(mean.len(), 16);
        assert!(var.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_fit_determinism() {
        let (x, y) = toy_data(12, 3);
        let run = || {
            let mut m = ViDkl::new(2, 1, Kernel::Matern52).unwrap();
            let losses = m.fit(7, &x.view(), &y.view(), 25, 0.05, None).unwrap();
            let (mean, _) = m.predict(7, &x.view()).unwrap();
            (losses, mean)
        };
        let (l1, p1) = run();
        let (l2, p2) = run();
        assert_eq!(l1, l2);
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_warm_start_accumulates_trace() {
        let (x, y) = toy_data(10, 5);
        let mut m = ViDkl::new(2, 1, Kernel::Rbf).unwrap();
        m.fit(1, &x.view(), &y.view(), 10, 0.05, None).unwrap();
        let after_first = m.loss_trace().to_vec();
        m.fit(1, &x.view(), &y.view(), 10, 0.05, None).unwrap();
        assert_eq!(m.loss_trace().len(), 20);
        assert_eq!(&m.loss_trace()[..10], after_first.as_slice());
    }

    #[test]
    fn test_minibatch_fit() {
        let (x, y) = toy_data(20, 9);
        let mut m = ViDkl::new(2, 1, Kernel::Rbf).unwrap();
        let losses = m.fit(4, &x.view(), &y.view(), 30, 0.05, Some(8)).unwrap();
        assert_eq!(losses.len(), 30);
        assert!(losses.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_learned_embedding_predicts_latent_factor() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (x, y) = toy_data(60, 17);
        let (x_train, x_test) = x.view().split_at(Axis(0), 40);
        let (y_train, y_test) = y.view().split_at(Axis(0), 40);
        let mut m = ViDkl::new(2, 1, Kernel::Rbf).unwrap();
        m.fit(2, &x_train, &y_train, 600, 0.05, None).unwrap();
        let (mean, _) = m.predict(2, &x_test).unwrap();
        let r = pearson(&mean.view(), &y_test);
        assert!(r > 0.9, "held-out correlation {r}");
        let z = m.embed(&x_test).unwrap();
        assert_eq!(z.dim(), (20, 1));
    }

    #[test]
    fn test_contract_violations() {
        let m = ViDkl::new(2, 1, Kernel::Rbf).unwrap();
        let xq = array![[0.0, 0.0]];
        assert!(matches!(
            m.predict(0, &xq.view()),
            Err(DklError::NotFitted)
        ));

        let (x, y) = toy_data(8, 1);
        let mut m = ViDkl::new(3, 1, Kernel::Rbf).unwrap();
        assert!(matches!(
            m.fit(0, &x.view(), &y.view(), 5, 0.05, None),
            Err(DklError::InvalidShape(_))
        ));

        let composite = Kernel::Sum(Box::new(Kernel::Rbf), Box::new(Kernel::Rbf));
        assert!(matches!(
            ViDkl::new(2, 1, composite),
            Err(DklError::UnsupportedKernel(_))
        ));
    }

    #[test]
    fn test_sample_posterior_shape_and_determinism() {
        let (x, y) = toy_data(10, 2);
        let mut m = ViDkl::new(2, 1, Kernel::Rbf).unwrap();
        m.fit(0, &x.view(), &y.view(), 30, 0.05, None).unwrap();
        let xq = array![[0.1, 0.2], [-0.4, 0.6]];
        let d1 = m.sample_posterior(5, &xq.view(), 4).unwrap();
        let d2 = m.sample_posterior(5, &xq.view(), 4).unwrap();
        assert_eq!(d1.dim(), (4, 2));
        assert_eq!(d1, d2);
    }
}
