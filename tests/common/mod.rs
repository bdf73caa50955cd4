//! Shared fixtures for the fleet integration tests.
//!
//! Provides the Gaussian objective, deterministic dataset generation, a
//! small Newton-style descent driving a [`MinimizerFunction`], and the lock
//! that serializes fleet tests within one test binary (each test forks real
//! processes).

// not every test binary uses every fixture
#![allow(dead_code)]

use std::cell::Cell;
use std::sync::{Mutex, MutexGuard, OnceLock};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use fitfleet::{MinimizerFunction, UnbinnedObjective};

/// Fleet tests fork; run them one at a time per binary.
pub fn fleet_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Mutex::new(()));
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Unit Gaussian samples restricted to the observable window `[-5, 5]`.
pub fn gaussian_dataset(seed: u64, n_events: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let mut data = Vec::with_capacity(n_events);
    while data.len() < n_events {
        let x: f64 = normal.sample(&mut rng);
        if (-5.0..=5.0).contains(&x) {
            data.push(x);
        }
    }
    data
}

/// `Gaussian(x; mu, sigma)` over a dataset; parameter 0 is `mu`,
/// parameter 1 is `sigma`.
#[derive(Clone)]
pub struct GaussianModel {
    pub data: Vec<f64>,
    pub mu: f64,
    pub sigma: f64,
    eval_count: Cell<u64>,
}

impl GaussianModel {
    pub fn new(data: Vec<f64>, mu: f64, sigma: f64) -> Self {
        Self {
            data,
            mu,
            sigma,
            eval_count: Cell::new(0),
        }
    }

    /// How many per-event log-probabilities this copy has computed.
    pub fn eval_count(&self) -> u64 {
        self.eval_count.get()
    }
}

impl UnbinnedObjective for GaussianModel {
    fn n_events(&self) -> usize {
        self.data.len()
    }

    fn n_parameters(&self) -> usize {
        2
    }

    fn parameter(&self, index: usize) -> f64 {
        match index {
            0 => self.mu,
            _ => self.sigma,
        }
    }

    fn set_parameter(&mut self, index: usize, value: f64) {
        match index {
            0 => self.mu = value,
            _ => self.sigma = value,
        }
    }

    fn log_prob(&self, event: usize) -> f64 {
        self.eval_count.set(self.eval_count.get() + 1);
        let z = (self.data[event] - self.mu) / self.sigma;
        -0.5 * z * z - self.sigma.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln()
    }
}

/// Result of one descent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitResult {
    pub min_nll: f64,
    pub mu: f64,
    pub mu_err: f64,
    pub edm: f64,
    pub n_iter: usize,
}

/// Deterministic Newton descent on the first free parameter, MIGRAD-flavored:
/// full second-derivative steps with halving on rejection, EDM stopping.
///
/// Every arithmetic step depends only on `(value, g, g2)` returned by the
/// function, so two functions producing bit-identical numbers walk
/// bit-identical trajectories.
pub fn migrad<O: UnbinnedObjective + Clone + 'static>(
    function: &mut MinimizerFunction<O>,
    start: &[f64],
) -> FitResult {
    let mut x = start.to_vec();
    let mut value = function.eval(&x).unwrap();
    let mut edm = f64::INFINITY;
    let mut n_iter = 0;

    while n_iter < 100 {
        n_iter += 1;
        let g = function.derivative(&x, 0).unwrap();
        let g2 = function.second_derivative(&x, 0).unwrap();
        edm = 0.5 * g * g / g2.abs().max(f64::MIN_POSITIVE);
        if edm < 1e-10 {
            break;
        }

        let mut step = if g2 > 0.0 { -g / g2 } else { -g.signum() * 0.1 };
        let mut accepted = false;
        let mut trial = x.clone();
        for _ in 0..20 {
            trial[0] = x[0] + step;
            let trial_value = function.eval(&trial).unwrap();
            if trial_value <= value {
                x[0] = trial[0];
                value = trial_value;
                accepted = true;
                break;
            }
            step *= 0.5;
        }
        if !accepted {
            break;
        }
    }

    let g2 = function.second_derivative(&x, 0).unwrap();
    let mu_err = (2.0 * 0.5 / g2.abs().max(f64::MIN_POSITIVE)).sqrt();
    FitResult {
        min_nll: value,
        mu: x[0],
        mu_err,
        edm,
        n_iter,
    }
}

/// True while `pid` names a live (unreaped) process.
pub fn process_alive(pid: i32) -> bool {
    std::path::Path::new(&format!("/proc/{}", pid)).exists()
}
