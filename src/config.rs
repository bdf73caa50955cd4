use std::thread;
use std::time::Duration;

use crate::likelihood::PartitionStrategy;

/// Runtime options for one fleet activation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker processes (the queue process is extra).
    pub n_workers: usize,
    /// How event-based jobs split their dataset over tasks.
    pub partition_strategy: PartitionStrategy,
    /// Add the extended maximum-likelihood term to the NLL.
    pub extended_likelihood: bool,
    /// Subtract a one-shot offset from the combined NLL to improve
    /// floating-point conditioning.
    pub likelihood_offsetting: bool,
    /// Weight events by their squared weight (variance-adjusted fits).
    pub apply_weight_squared: bool,
    /// Switch master sends to non-blocking mode once the handshake passed.
    pub send_nonblocking: bool,
    /// Bound on every connection-test receive.
    pub handshake_timeout: Duration,
    /// How long teardown waits for children before escalating to SIGKILL.
    pub termination_grace: Duration,
    pub derivator: DerivatorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_workers: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            partition_strategy: PartitionStrategy::Bulk,
            extended_likelihood: false,
            likelihood_offsetting: true,
            apply_weight_squared: false,
            send_nonblocking: true,
            handshake_timeout: Duration::from_secs(10),
            termination_grace: Duration::from_secs(5),
            derivator: DerivatorConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(n_workers: usize) -> Self {
        Self {
            n_workers,
            ..Default::default()
        }
    }

    pub fn with_strategy(mut self, strategy: PartitionStrategy) -> Self {
        self.partition_strategy = strategy;
        self
    }

    pub fn with_extended_likelihood(mut self, flag: bool) -> Self {
        self.extended_likelihood = flag;
        self
    }

    pub fn with_likelihood_offsetting(mut self, flag: bool) -> Self {
        self.likelihood_offsetting = flag;
        self
    }

    pub fn with_apply_weight_squared(mut self, flag: bool) -> Self {
        self.apply_weight_squared = flag;
        self
    }

    pub fn with_derivator(mut self, derivator: DerivatorConfig) -> Self {
        self.derivator = derivator;
        self
    }
}

/// Tolerances and cycle budget for the numerical-differentiation kernel.
///
/// The presets mirror the Minuit2 strategy levels; strategy 1 is the default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivatorConfig {
    pub step_tolerance: f64,
    pub grad_tolerance: f64,
    pub ncycles: usize,
    /// Function-rise defining one standard deviation (0.5 for a NLL).
    pub error_level: f64,
}

impl Default for DerivatorConfig {
    fn default() -> Self {
        Self::strategy(1)
    }
}

impl DerivatorConfig {
    /// Tolerances for a Minuit2 strategy level. Levels above 2 clamp to 2.
    pub fn strategy(level: u8) -> Self {
        let (step_tolerance, grad_tolerance, ncycles) = match level {
            0 => (0.5, 0.1, 2),
            1 => (0.3, 0.05, 3),
            _ => (0.1, 0.02, 5),
        };
        Self {
            step_tolerance,
            grad_tolerance,
            ncycles,
            error_level: 0.5,
        }
    }

    pub fn with_error_level(mut self, error_level: f64) -> Self {
        self.error_level = error_level;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_positive_worker_count() {
        let config = EngineConfig::default();
        assert!(config.n_workers >= 1);
        assert!(config.likelihood_offsetting);
        assert!(!config.extended_likelihood);
    }

    #[test]
    fn strategy_presets_tighten_with_level() {
        let s0 = DerivatorConfig::strategy(0);
        let s1 = DerivatorConfig::strategy(1);
        let s2 = DerivatorConfig::strategy(2);
        assert!(s0.step_tolerance > s1.step_tolerance);
        assert!(s1.step_tolerance > s2.step_tolerance);
        assert!(s0.ncycles < s2.ncycles);
    }
}
