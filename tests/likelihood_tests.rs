//! Gaussian NLL parity: the fleet must reproduce the serial fold of the
//! same canonical partition order bit for bit, for every worker count and
//! partition strategy.

mod common;

use fitfleet::{
    EngineConfig, JobManager, KahanSum, ParallelLikelihood, PartitionStrategy,
    PartitionedLikelihood, UnbinnedObjective,
};

use common::{fleet_lock, gaussian_dataset, init_tracing, GaussianModel};

const N_EVENTS: usize = 10_000;
const SEED: u64 = 3;

fn model() -> GaussianModel {
    GaussianModel::new(gaussian_dataset(SEED, N_EVENTS), 0.0, 1.0)
}

fn serial_reference(strategy: PartitionStrategy, n_workers: usize, mu: f64) -> f64 {
    let mut objective = model();
    objective.mu = mu;
    let n_tasks = strategy.n_tasks(N_EVENTS, n_workers);
    let mut nll = PartitionedLikelihood::new(objective, strategy, n_tasks).with_offsetting(false);
    let (value, errors) = nll.evaluate_local().unwrap();
    assert!(errors.is_empty());
    value
}

#[test]
fn parallel_nll_matches_serial_for_every_worker_count_and_strategy() {
    let _guard = fleet_lock();
    init_tracing();

    for n_workers in [1, 2, 3, 4] {
        for strategy in [
            PartitionStrategy::Bulk,
            PartitionStrategy::Interleaved,
            PartitionStrategy::PerEvent,
        ] {
            let expected = serial_reference(strategy, n_workers, 0.0);

            let manager = JobManager::new(
                EngineConfig::new(n_workers)
                    .with_strategy(strategy)
                    .with_likelihood_offsetting(false),
            );
            let config = manager.borrow().config().clone();
            let nll =
                ParallelLikelihood::new(&manager, PartitionedLikelihood::from_config(model(), &config))
                    .unwrap();
            let value = nll.evaluate().unwrap();

            assert_eq!(
                value.to_bits(),
                expected.to_bits(),
                "strategy {} with {} workers drifted: {} != {}",
                strategy,
                n_workers,
                value,
                expected
            );
        }
    }
}

#[test]
fn single_task_partitions_equal_the_plain_event_order_sum() {
    let _guard = fleet_lock();
    init_tracing();

    let objective = model();
    let mut plain = KahanSum::new();
    for event in 0..objective.n_events() {
        plain.add(-objective.log_prob(event));
    }

    for strategy in [PartitionStrategy::Bulk, PartitionStrategy::Interleaved] {
        assert_eq!(serial_reference(strategy, 1, 0.0).to_bits(), plain.sum().to_bits());

        let manager = JobManager::new(
            EngineConfig::new(1)
                .with_strategy(strategy)
                .with_likelihood_offsetting(false),
        );
        let config = manager.borrow().config().clone();
        let nll =
            ParallelLikelihood::new(&manager, PartitionedLikelihood::from_config(model(), &config))
                .unwrap();
        assert_eq!(nll.evaluate().unwrap().to_bits(), plain.sum().to_bits());
    }
}

#[test]
fn parameter_change_between_evaluations_stays_in_parity() {
    let _guard = fleet_lock();
    init_tracing();

    for n_workers in [1, 2, 3] {
        let strategy = PartitionStrategy::Bulk;
        let manager = JobManager::new(
            EngineConfig::new(n_workers)
                .with_strategy(strategy)
                .with_likelihood_offsetting(false),
        );
        let config = manager.borrow().config().clone();
        let nll =
            ParallelLikelihood::new(&manager, PartitionedLikelihood::from_config(model(), &config))
                .unwrap();

        assert_eq!(
            nll.evaluate().unwrap().to_bits(),
            serial_reference(strategy, n_workers, 0.0).to_bits()
        );

        nll.set_parameter(0, 2.0).unwrap();
        assert_eq!(
            nll.evaluate().unwrap().to_bits(),
            serial_reference(strategy, n_workers, 2.0).to_bits()
        );
    }
}

#[test]
fn offsetting_zeroes_the_first_value_and_is_recoverable() {
    let _guard = fleet_lock();
    init_tracing();

    let manager = JobManager::new(EngineConfig::new(2).with_likelihood_offsetting(true));
    let config = manager.borrow().config().clone();
    let nll = ParallelLikelihood::new(&manager, PartitionedLikelihood::from_config(model(), &config))
        .unwrap();

    let raw = serial_reference(PartitionStrategy::Bulk, 2, 0.0);
    let first = nll.evaluate().unwrap();
    let offset = nll.offset().unwrap();
    assert!(first.abs() < 1e-6, "offset evaluation was {}", first);
    assert!((offset + first - raw).abs() < 1e-6);

    // a second evaluation at the same parameters subtracts the same offset
    let second = nll.evaluate().unwrap();
    assert_eq!(first.to_bits(), second.to_bits());
}

#[test]
fn extended_likelihood_keeps_parity() {
    let _guard = fleet_lock();
    init_tracing();

    let mut serial =
        PartitionedLikelihood::new(model(), PartitionStrategy::Bulk, 3)
            .with_offsetting(false)
            .with_extended(true);
    let (expected, _) = serial.evaluate_local().unwrap();

    let manager = JobManager::new(
        EngineConfig::new(3)
            .with_likelihood_offsetting(false)
            .with_extended_likelihood(true),
    );
    let config = manager.borrow().config().clone();
    let nll = ParallelLikelihood::new(&manager, PartitionedLikelihood::from_config(model(), &config))
        .unwrap();
    assert_eq!(nll.evaluate().unwrap().to_bits(), expected.to_bits());
}
