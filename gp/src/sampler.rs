use finitediff::FiniteDiff;
use ndarray::{s, Array1, Array2};
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;

/// Settings of the Hamiltonian Monte Carlo transition kernel.
#[derive(Clone, Debug)]
pub struct HmcSettings {
    /// Number of leapfrog steps per proposal
    pub num_leapfrog: usize,
    /// Acceptance probability targeted by step-size adaptation during warmup
    pub target_accept: f64,
    /// Step size before adaptation
    pub initial_step_size: f64,
    /// A transition is divergent when the Hamiltonian error exceeds this
    pub divergence_threshold: f64,
}

impl Default for HmcSettings {
    fn default() -> Self {
        HmcSettings {
            num_leapfrog: 16,
            target_accept: 0.8,
            initial_step_size: 0.1,
            divergence_threshold: 1000.0,
        }
    }
}

/// Per-chain sampler diagnostics, reported on the fitted model.
#[derive(Clone, Debug)]
pub struct ChainStats {
    /// Fraction of accepted post-warmup transitions
    pub accept_rate: f64,
    /// Number of divergent post-warmup transitions
    pub divergences: usize,
    /// Step size after warmup adaptation
    pub step_size: f64,
}

/// Deterministic sub-seed derivation (splitmix64 finalizer) so that parallel
/// chains and per-draw generators never share a stream.
pub fn derive_seed(seed: u64, stream: u64) -> u64 {
    let mut z = seed ^ stream.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Run `num_chains` independent HMC chains over the unconstrained target
/// `logp`, in parallel, each seeded from a deterministically derived
/// sub-seed. Returns the stacked post-warmup draws, chain-major with shape
/// (num_chains * num_samples, dim), plus per-chain statistics in chain order.
pub fn run_chains<F, I>(
    seed: u64,
    num_chains: usize,
    num_warmup: usize,
    num_samples: usize,
    logp: &F,
    init: &I,
    settings: &HmcSettings,
) -> (Array2<f64>, Vec<ChainStats>)
where
    F: Fn(&Array1<f64>) -> f64 + Sync,
    I: Fn(&mut Xoshiro256Plus) -> Array1<f64> + Sync,
{
    let results: Vec<(Array2<f64>, ChainStats)> = (0..num_chains)
        .into_par_iter()
        .map(|c| {
            sample_chain(
                derive_seed(seed, c as u64),
                num_warmup,
                num_samples,
                logp,
                init,
                settings,
            )
        })
        .collect();

    let dim = results[0].0.ncols();
    let mut draws = Array2::zeros((num_chains * num_samples, dim));
    let mut stats = Vec::with_capacity(num_chains);
    for (c, (chain_draws, chain_stats)) in results.into_iter().enumerate() {
        draws
            .slice_mut(s![c * num_samples..(c + 1) * num_samples, ..])
            .assign(&chain_draws);
        log::debug!(
            "chain {c}: acceptance {:.2}, step size {:.3e}, divergences {}",
            chain_stats.accept_rate,
            chain_stats.step_size,
            chain_stats.divergences
        );
        stats.push(chain_stats);
    }
    (draws, stats)
}

fn sample_chain<F, I>(
    seed: u64,
    num_warmup: usize,
    num_samples: usize,
    logp: &F,
    init: &I,
    settings: &HmcSettings,
) -> (Array2<f64>, ChainStats)
where
    F: Fn(&Array1<f64>) -> f64 + Sync,
    I: Fn(&mut Xoshiro256Plus) -> Array1<f64> + Sync,
{
    let mut rng = Xoshiro256Plus::seed_from_u64(seed);
    let mut z = init(&mut rng);
    let dim = z.len();
    let mut cur_lp = logp(&z);

    let grad = |v: &Array1<f64>| v.central_diff(&|w: &Array1<f64>| logp(w));

    // Nesterov dual averaging of the step size during warmup
    let mut eps = settings.initial_step_size;
    let mu = (10.0 * eps).ln();
    let mut log_eps_bar = eps.ln();
    let mut h_bar = 0.0;
    let (gamma, t0, kappa) = (0.05, 10.0, 0.75);

    let mut draws = Array2::zeros((num_samples, dim));
    let mut divergences = 0usize;
    let mut accept_sum = 0.0;

    for iter in 0..(num_warmup + num_samples) {
        let p0: Array1<f64> = (0..dim)
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        let h0 = -cur_lp + 0.5 * p0.dot(&p0);

        // leapfrog integration
        let mut zl = z.clone();
        let mut g = grad(&zl);
        let mut pl = &p0 + &(&g * (0.5 * eps));
        for step in 0..settings.num_leapfrog {
            zl = &zl + &(&pl * eps);
            g = grad(&zl);
            if step + 1 < settings.num_leapfrog {
                pl = &pl + &(&g * eps);
            }
        }
        pl = &pl + &(&g * (0.5 * eps));

        let prop_lp = logp(&zl);
        let energy_error = (-prop_lp + 0.5 * pl.dot(&pl)) - h0;
        let divergent =
            !energy_error.is_finite() || energy_error > settings.divergence_threshold;
        let accept_stat = if divergent {
            0.0
        } else {
            (-energy_error).exp().min(1.0)
        };
        if !divergent && rng.gen::<f64>() < accept_stat {
            z = zl;
            cur_lp = prop_lp;
        }

        if iter < num_warmup {
            let m = (iter + 1) as f64;
            h_bar = (1.0 - 1.0 / (m + t0)) * h_bar
                + (settings.target_accept - accept_stat) / (m + t0);
            let log_eps = mu - m.sqrt() / gamma * h_bar;
            let eta = m.powf(-kappa);
            log_eps_bar = eta * log_eps + (1.0 - eta) * log_eps_bar;
            eps = log_eps.exp().max(1e-8);
            if iter + 1 == num_warmup {
                eps = log_eps_bar.exp().max(1e-8);
            }
        } else {
            if divergent {
                divergences += 1;
            }
            accept_sum += accept_stat;
            draws.row_mut(iter - num_warmup).assign(&z);
        }
    }

    let stats = ChainStats {
        accept_rate: accept_sum / num_samples.max(1) as f64,
        divergences,
        step_size: eps,
    };
    (draws, stats)
}
