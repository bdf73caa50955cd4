//! Parallel numerical gradients and the minimizer-facing function.

mod derivator;

pub use derivator::{Derivative, NumericalDerivator};

use std::any::Any;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::config::EngineConfig;
use crate::error::{FleetError, Result};
use crate::job::{EvalError, Job, ManagerHandle, Task, TaskOutcome};
use crate::likelihood::{serial_nll, UnbinnedObjective};
use crate::parameters::{free_indices, ParameterSettings};

/// A [`Job`] with one task per free parameter: each task runs the serial
/// differentiation kernel for its component against the worker's parameter
/// shadow and ships back a `(g, g2, step)` triple.
pub struct GradientJob<O: UnbinnedObjective + 'static> {
    objective: O,
    settings: Vec<ParameterSettings>,
    free: Vec<usize>,
    derivator: NumericalDerivator,
    extended: bool,
    apply_weight_squared: bool,
    results: BTreeMap<Task, Derivative>,
    pending_errors: Vec<EvalError>,
}

impl<O: UnbinnedObjective + 'static> GradientJob<O> {
    pub fn new(mut objective: O, settings: Vec<ParameterSettings>, config: &EngineConfig) -> Self {
        let free = free_indices(&settings);
        for (ix, s) in settings.iter().enumerate() {
            objective.set_parameter(ix, s.value);
        }
        Self {
            objective,
            settings,
            free,
            derivator: NumericalDerivator::new(config.derivator),
            extended: config.extended_likelihood,
            apply_weight_squared: config.apply_weight_squared,
            results: BTreeMap::new(),
            pending_errors: Vec::new(),
        }
    }

    pub fn n_free(&self) -> usize {
        self.free.len()
    }

    /// Drain the buffered components. Fails unless every free parameter has
    /// reported.
    pub fn take_results(&mut self) -> Result<(Vec<(usize, Derivative)>, Vec<EvalError>)> {
        if self.results.len() != self.free.len() {
            return Err(FleetError::Protocol(format!(
                "gradient has {} of {} components",
                self.results.len(),
                self.free.len()
            )));
        }
        let components = std::mem::take(&mut self.results)
            .into_iter()
            .map(|(task, derivative)| (task as usize, derivative))
            .collect();
        Ok((components, std::mem::take(&mut self.pending_errors)))
    }
}

impl<O: UnbinnedObjective + 'static> Job for GradientJob<O> {
    fn partition(&self) -> Vec<Task> {
        (0..self.free.len() as Task).collect()
    }

    fn execute_task(&mut self, task: Task) -> Result<TaskOutcome> {
        let slot = task as usize;
        if slot >= self.free.len() {
            return Err(FleetError::Protocol(format!(
                "gradient task {} out of range",
                task
            )));
        }
        let Self {
            objective,
            settings,
            free,
            derivator,
            extended,
            apply_weight_squared,
            ..
        } = self;

        let mut x: Vec<f64> = free.iter().map(|&ix| settings[ix].value).collect();
        let free_settings: Vec<ParameterSettings> =
            free.iter().map(|&ix| settings[ix]).collect();

        let mut eval_errors = Vec::new();
        let derivative = {
            let f = |xs: &[f64]| {
                for (free_slot, &param_ix) in free.iter().enumerate() {
                    objective.set_parameter(param_ix, xs[free_slot]);
                }
                serial_nll(&*objective, *extended, *apply_weight_squared, &mut eval_errors)
            };
            derivator.partial_derivative(f, &mut x, &free_settings, slot)
        };
        // leave the shadow exactly where the minimizer put it
        for &param_ix in free.iter() {
            objective.set_parameter(param_ix, settings[param_ix].value);
        }

        Ok(TaskOutcome {
            payload: bincode::serialize(&derivative)?,
            eval_errors,
        })
    }

    fn receive_task_result(&mut self, task: Task, outcome: TaskOutcome) -> Result<()> {
        let derivative: Derivative = bincode::deserialize(&outcome.payload)?;
        self.results.insert(task, derivative);
        self.pending_errors.extend(outcome.eval_errors);
        Ok(())
    }

    fn update_parameter(&mut self, index: usize, value: f64, is_constant: bool) {
        if let Some(settings) = self.settings.get_mut(index) {
            if settings.is_constant != is_constant {
                tracing::warn!(index, "ignoring constness change after activation");
            }
            settings.value = value;
        }
        self.objective.set_parameter(index, value);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// How the minimizer function obtains its gradient components.
enum GradientBackend {
    /// Run the differentiation kernel in-process, one component on demand.
    Serial,
    /// Submit a [`GradientJob`] to the fleet; all components at once.
    Parallel { manager: ManagerHandle, job_id: u64 },
}

/// The multi-dimensional differentiable function handed to the minimizer.
///
/// Dimensions are the free parameters only. Parameter state is synchronized
/// lazily: whenever the minimizer calls in with a changed `x`, the changed
/// components are pushed to the master objective (and broadcast to worker
/// shadows when a fleet backend is attached) and the per-component
/// derivative cache is invalidated.
pub struct MinimizerFunction<O: UnbinnedObjective + Clone + 'static> {
    objective: O,
    settings: Vec<ParameterSettings>,
    free: Vec<usize>,
    derivator: NumericalDerivator,
    extended: bool,
    apply_weight_squared: bool,
    backend: GradientBackend,
    grad_params: Vec<f64>,
    grad: Vec<Derivative>,
    has_been_calculated: Vec<bool>,
    none_have_been_calculated: bool,
    max_fcn: f64,
    num_bad_nll: u32,
    print_eval_errors: u32,
    do_eval_error_wall: bool,
    eval_count: u64,
}

impl<O: UnbinnedObjective + Clone + 'static> MinimizerFunction<O> {
    /// Purely in-process function: serial evaluation and serial gradient.
    pub fn serial(objective: O, settings: Vec<ParameterSettings>, config: &EngineConfig) -> Self {
        Self::build(objective, settings, config, GradientBackend::Serial)
    }

    /// Gradient components computed by the fleet; evaluation stays serial on
    /// the master. The job registers now, so the fleet must not be
    /// activated yet.
    pub fn parallel(
        manager: &ManagerHandle,
        objective: O,
        settings: Vec<ParameterSettings>,
    ) -> Result<Self> {
        let config = manager.borrow().config().clone();
        let job = GradientJob::new(objective.clone(), settings.clone(), &config);
        let job_id = manager.borrow_mut().register(Box::new(job))?;
        Ok(Self::build(
            objective,
            settings,
            &config,
            GradientBackend::Parallel {
                manager: Rc::clone(manager),
                job_id,
            },
        ))
    }

    fn build(
        mut objective: O,
        settings: Vec<ParameterSettings>,
        config: &EngineConfig,
        backend: GradientBackend,
    ) -> Self {
        for (ix, s) in settings.iter().enumerate() {
            objective.set_parameter(ix, s.value);
        }
        let free = free_indices(&settings);
        let derivator = NumericalDerivator::new(config.derivator);
        let grad_params: Vec<f64> = free.iter().map(|&ix| settings[ix].value).collect();
        let grad: Vec<Derivative> = free
            .iter()
            .map(|&ix| derivator.initial_estimate(&settings[ix]))
            .collect();
        let n_free = free.len();
        Self {
            objective,
            settings,
            free,
            derivator,
            extended: config.extended_likelihood,
            apply_weight_squared: config.apply_weight_squared,
            backend,
            grad_params,
            grad,
            has_been_calculated: vec![false; n_free],
            none_have_been_calculated: true,
            max_fcn: -1.0e30,
            num_bad_nll: 0,
            print_eval_errors: 10,
            do_eval_error_wall: true,
            eval_count: 0,
        }
    }

    pub fn n_dim(&self) -> usize {
        self.free.len()
    }

    /// The master-side objective copy.
    pub fn objective(&self) -> &O {
        &self.objective
    }

    pub fn returns_in_minuit2_parameter_space(&self) -> bool {
        true
    }

    pub fn eval_count(&self) -> u64 {
        self.eval_count
    }

    pub fn zero_eval_count(&mut self) {
        self.eval_count = 0;
    }

    pub fn num_bad_nll(&self) -> u32 {
        self.num_bad_nll
    }

    pub fn max_fcn(&self) -> f64 {
        self.max_fcn
    }

    pub fn set_eval_error_wall(&mut self, flag: bool) {
        self.do_eval_error_wall = flag;
    }

    pub fn set_print_eval_errors(&mut self, budget: u32) {
        self.print_eval_errors = budget;
    }

    /// The objective value at `x`, with the error wall applied: a failed
    /// evaluation returns `max_fcn + 1` so the minimizer backs out of the
    /// region.
    pub fn eval(&mut self, x: &[f64]) -> Result<f64> {
        self.sync_parameters(x)?;
        let mut eval_errors = Vec::new();
        let mut value = serial_nll(
            &self.objective,
            self.extended,
            self.apply_weight_squared,
            &mut eval_errors,
        );
        self.eval_count += 1;

        if !eval_errors.is_empty() || !value.is_finite() || value > 1.0e30 {
            self.report_eval_errors(&eval_errors, value);
            self.num_bad_nll += 1;
            if self.do_eval_error_wall {
                value = self.max_fcn + 1.0;
            }
        } else if value > self.max_fcn {
            self.max_fcn = value;
        }
        Ok(value)
    }

    pub fn derivative(&mut self, x: &[f64], component: usize) -> Result<f64> {
        self.sync_parameters(x)?;
        self.run_derivator(component)?;
        Ok(self.grad[component].grad)
    }

    pub fn second_derivative(&mut self, x: &[f64], component: usize) -> Result<f64> {
        self.sync_parameters(x)?;
        self.run_derivator(component)?;
        Ok(self.grad[component].second)
    }

    pub fn step_size(&mut self, x: &[f64], component: usize) -> Result<f64> {
        self.sync_parameters(x)?;
        self.run_derivator(component)?;
        Ok(self.grad[component].step)
    }

    /// Adopt new parameter values (and step sizes) from the minimizer. The
    /// free/fixed pattern is part of the fleet topology and cannot change
    /// after construction.
    pub fn synchronize_parameter_settings(
        &mut self,
        settings: &[ParameterSettings],
    ) -> Result<bool> {
        if settings.len() != self.settings.len()
            || settings
                .iter()
                .zip(self.settings.iter())
                .any(|(new, old)| new.is_constant != old.is_constant)
        {
            return Err(FleetError::Config(
                "parameter layout changed after construction".into(),
            ));
        }
        let x: Vec<f64> = self.free.iter().map(|&ix| settings[ix].value).collect();
        self.sync_parameters(&x)?;
        for (ix, new) in settings.iter().enumerate() {
            self.settings[ix].step_size = new.step_size;
            self.settings[ix].lower_bound = new.lower_bound;
            self.settings[ix].upper_bound = new.upper_bound;
        }
        Ok(true)
    }

    /// Push changed components of `x` to the objective and the worker
    /// shadows, invalidating the derivative cache when anything moved.
    fn sync_parameters(&mut self, x: &[f64]) -> Result<bool> {
        if x.len() != self.free.len() {
            return Err(FleetError::Config(format!(
                "expected {} free parameters, got {}",
                self.free.len(),
                x.len()
            )));
        }
        let mut has_been_synced = false;
        for (slot, &value) in x.iter().enumerate() {
            if self.grad_params[slot] != value {
                self.grad_params[slot] = value;
                let param_ix = self.free[slot];
                self.objective.set_parameter(param_ix, value);
                self.settings[param_ix].value = value;
                if let GradientBackend::Parallel { manager, job_id } = &self.backend {
                    manager
                        .borrow_mut()
                        .update_parameter(*job_id, param_ix, value, false)?;
                }
                has_been_synced = true;
            }
        }
        if has_been_synced && !self.none_have_been_calculated {
            for calculated in self.has_been_calculated.iter_mut() {
                *calculated = false;
            }
            self.none_have_been_calculated = true;
        }
        Ok(has_been_synced)
    }

    fn run_derivator(&mut self, component: usize) -> Result<()> {
        if component >= self.free.len() {
            return Err(FleetError::Config(format!(
                "derivative component {} out of range",
                component
            )));
        }
        if self.has_been_calculated[component] {
            return Ok(());
        }
        match &self.backend {
            GradientBackend::Serial => {
                let Self {
                    objective,
                    settings,
                    free,
                    derivator,
                    extended,
                    apply_weight_squared,
                    grad_params,
                    ..
                } = self;
                let free_settings: Vec<ParameterSettings> =
                    free.iter().map(|&ix| settings[ix]).collect();
                let mut x = grad_params.clone();
                let mut eval_errors = Vec::new();
                let derivative = {
                    let f = |xs: &[f64]| {
                        for (slot, &param_ix) in free.iter().enumerate() {
                            objective.set_parameter(param_ix, xs[slot]);
                        }
                        serial_nll(&*objective, *extended, *apply_weight_squared, &mut eval_errors)
                    };
                    derivator.partial_derivative(f, &mut x, &free_settings, component)
                };
                for (slot, &param_ix) in free.iter().enumerate() {
                    objective.set_parameter(param_ix, grad_params[slot]);
                }
                self.report_eval_errors(&eval_errors, f64::NAN);
                self.grad[component] = derivative;
                self.has_been_calculated[component] = true;
                self.none_have_been_calculated = false;
            }
            GradientBackend::Parallel { manager, job_id } => {
                let job_id = *job_id;
                let mut manager = manager.borrow_mut();
                if !manager.is_activated() {
                    manager.activate()?;
                }
                manager.submit(job_id)?;
                manager.retrieve()?;
                let (components, eval_errors) =
                    manager.with_job_mut::<GradientJob<O>, _>(job_id, |j| j.take_results())??;
                drop(manager);
                for (slot, derivative) in components {
                    self.grad[slot] = derivative;
                    self.has_been_calculated[slot] = true;
                }
                self.none_have_been_calculated = false;
                self.report_eval_errors(&eval_errors, f64::NAN);
            }
        }
        Ok(())
    }

    fn report_eval_errors(&mut self, eval_errors: &[EvalError], value: f64) {
        if eval_errors.is_empty() {
            return;
        }
        if self.print_eval_errors > 0 {
            self.print_eval_errors -= 1;
            tracing::warn!(
                n_errors = eval_errors.len(),
                first = %eval_errors[0].message,
                arg_id = eval_errors[0].arg_id,
                value,
                "objective evaluation errors"
            );
        }
    }
}

impl<O: UnbinnedObjective + Clone + 'static> Drop for MinimizerFunction<O> {
    fn drop(&mut self) {
        if let GradientBackend::Parallel { manager, job_id } = &self.backend {
            if let Ok(mut manager) = manager.try_borrow_mut() {
                manager.deregister(*job_id);
            }
        }
    }
}
