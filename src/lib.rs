//! fitfleet: parallel likelihood and gradient evaluation for numerical
//! optimization.
//!
//! A minimizer running on the master process asks for objective values and
//! partial derivatives; the engine spreads those evaluations over a fleet of
//! forked worker processes (one queue process in between) and folds the
//! results back in a fixed canonical order, so every answer is bit-identical
//! to the serial computation.
//!
//! Parallelism is by process, not thread: coordination happens exclusively
//! through typed messages over Unix-domain socket pairs created before the
//! fork. Jobs register with the [`job::JobManager`] first; the first
//! evaluation activates the fleet.

pub mod config;
pub mod error;
pub mod gradient;
pub mod job;
pub mod likelihood;
pub mod messenger;
pub mod parameters;
pub mod process;
pub mod queue;
pub mod transport;

pub use config::{DerivatorConfig, EngineConfig};
pub use error::{FleetError, Result};
pub use gradient::{Derivative, GradientJob, MinimizerFunction, NumericalDerivator};
pub use job::{EvalError, Job, JobManager, JobTask, ManagerHandle, Task, TaskOutcome};
pub use likelihood::{
    KahanSum, ParallelLikelihood, PartitionStrategy, PartitionedLikelihood, UnbinnedObjective,
};
pub use parameters::ParameterSettings;
