use serde::{Deserialize, Serialize};

use crate::config::DerivatorConfig;
use crate::parameters::ParameterSettings;

/// One component's derivative bundle: first derivative, second derivative,
/// and the step size that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Derivative {
    pub grad: f64,
    pub second: f64,
    pub step: f64,
}

/// Serial Minuit2-compatible numerical differentiation.
///
/// Each call is self-contained: the starting `(g, g2, step)` estimate is
/// derived from the parameter settings and then refined with symmetric
/// central differences for up to `ncycles` iterations. Because no state
/// survives between calls, any process computing a component from the same
/// parameter values produces bit-identical output.
#[derive(Debug, Clone, Copy)]
pub struct NumericalDerivator {
    config: DerivatorConfig,
}

impl NumericalDerivator {
    pub fn new(config: DerivatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DerivatorConfig {
        &self.config
    }

    /// The cheap starting estimate Minuit2 seeds its gradient with, from
    /// the parameter's step size alone.
    pub fn initial_estimate(&self, settings: &ParameterSettings) -> Derivative {
        let eps2 = f64::EPSILON.sqrt();
        let gsmin = 8.0 * eps2 * (settings.value.abs() + eps2);
        let dirin = settings.step_size.max(gsmin);
        let second = 2.0 * self.config.error_level / (dirin * dirin);
        let mut step = gsmin.max(0.1 * dirin);
        if settings.has_limits() {
            step = step.min(0.5);
        }
        Derivative {
            grad: second * dirin,
            second,
            step,
        }
    }

    /// `(∂f/∂x_j, ∂²f/∂x_j², step_j)` at `x`, evaluating `f` once at the
    /// center and twice per refinement cycle.
    ///
    /// The step is driven towards `sqrt(dfmin / |g2|)` and clamped to the
    /// usual Minuit2 bounds; cycles stop early once either the step or the
    /// derivative moves less than its tolerance.
    pub fn partial_derivative<F>(
        &self,
        mut f: F,
        x: &mut [f64],
        settings: &[ParameterSettings],
        component: usize,
    ) -> Derivative
    where
        F: FnMut(&[f64]) -> f64,
    {
        let eps = f64::EPSILON;
        let eps2 = eps.sqrt();

        let center = f(x);
        let mut current = self.initial_estimate(&settings[component]);

        let dfmin = 8.0 * eps2 * (center.abs() + self.config.error_level);
        let vrysml = 8.0 * eps * eps;
        let xval = x[component];
        let epspri = eps2 + current.grad.abs() * eps2;
        let has_limits = settings[component].has_limits();

        let mut step_old = 0.0;
        for _ in 0..self.config.ncycles {
            let optstp = (dfmin / (current.second.abs() + epspri)).sqrt();
            let mut step = optstp.max(0.1 * current.step.abs());
            if has_limits && step > 0.5 {
                step = 0.5;
            }
            let stpmax = 10.0 * current.step.abs();
            if step > stpmax {
                step = stpmax;
            }
            let stpmin = vrysml.max(8.0 * (eps2 * xval).abs());
            if step < stpmin {
                step = stpmin;
            }
            if ((step - step_old) / step).abs() < self.config.step_tolerance {
                break;
            }
            current.step = step;
            step_old = step;

            x[component] = xval + step;
            let up = f(x);
            x[component] = xval - step;
            let down = f(x);
            x[component] = xval;

            let grad_old = current.grad;
            current.grad = 0.5 * (up - down) / step;
            current.second = (up + down - 2.0 * center) / (step * step);

            if ((grad_old - current.grad) / (current.grad.abs() + dfmin / step)).abs()
                < self.config.grad_tolerance
            {
                break;
            }
        }

        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derivator() -> NumericalDerivator {
        NumericalDerivator::new(DerivatorConfig::default())
    }

    #[test]
    fn recovers_the_slope_of_a_linear_function() {
        let settings = vec![ParameterSettings::new(1.0, 0.1)];
        let mut x = vec![1.0];
        let d = derivator().partial_derivative(|x| 3.0 * x[0] + 1.0, &mut x, &settings, 0);
        assert!((d.grad - 3.0).abs() < 1e-6);
        assert!(d.second.abs() < 1e-3);
        assert_eq!(x[0], 1.0);
    }

    #[test]
    fn recovers_the_curvature_of_a_parabola() {
        let settings = vec![ParameterSettings::new(0.5, 0.1)];
        let mut x = vec![0.5];
        let d = derivator().partial_derivative(|x| x[0] * x[0], &mut x, &settings, 0);
        assert!((d.grad - 1.0).abs() < 1e-6);
        assert!((d.second - 2.0).abs() < 1e-4);
        assert!(d.step > 0.0);
    }

    #[test]
    fn only_the_requested_component_is_perturbed() {
        let settings = vec![
            ParameterSettings::new(2.0, 0.1),
            ParameterSettings::new(-1.0, 0.1),
        ];
        let mut x = vec![2.0, -1.0];
        let d = derivator().partial_derivative(
            |x| x[0] * x[0] + 10.0 * x[1],
            &mut x,
            &settings,
            1,
        );
        assert!((d.grad - 10.0).abs() < 1e-6);
        assert_eq!(x, vec![2.0, -1.0]);
    }

    #[test]
    fn identical_inputs_give_bit_identical_output() {
        let settings = vec![ParameterSettings::new(0.3, 0.01).with_bounds(-3.0, 3.0)];
        let f = |x: &[f64]| (x[0] - 1.0).powi(2) + (x[0] * 3.0).sin();
        let mut x1 = vec![0.3];
        let mut x2 = vec![0.3];
        let a = derivator().partial_derivative(f, &mut x1, &settings, 0);
        let b = derivator().partial_derivative(f, &mut x2, &settings, 0);
        assert_eq!(a.grad.to_bits(), b.grad.to_bits());
        assert_eq!(a.second.to_bits(), b.second.to_bits());
        assert_eq!(a.step.to_bits(), b.step.to_bits());
    }

    #[test]
    fn bounded_parameters_keep_steps_below_half() {
        let settings = vec![ParameterSettings::new(0.0, 20.0).with_bounds(-30.0, 30.0)];
        let mut x = vec![0.0];
        let d = derivator().partial_derivative(|x| x[0].powi(2), &mut x, &settings, 0);
        assert!(d.step <= 0.5);
    }
}
