mod support;

use std::{sync::Arc, time::Duration};

use federated_orchestra::{
    FedAvg, ParticipantFactory, ParticipantId, RoundOrchestrator, SessionConfig, SessionStatus,
    common::TaskKind,
    config::ResourceSpec,
    registry::ParticipantRegistry,
    start_simulation,
};
use support::{Action, Tally, builder, round_config, single};
use tokio::time;

fn config(budget: u32, rounds: u64) -> SessionConfig {
    SessionConfig {
        num_rounds: rounds,
        fraction_fit: 1.0,
        fraction_evaluate: 0.0,
        min_fit_participants: 1,
        min_available_participants: 1,
        resource_budget: ResourceSpec::Slots(budget),
        seed: Some(11),
        ..SessionConfig::default()
    }
}

fn strategy(config: &SessionConfig) -> FedAvg {
    FedAvg::from_config(config)
        .with_initial_parameters(single(0.0))
        .with_fit_config(round_config)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatch_never_exceeds_the_budget() {
    let tally = Arc::new(Tally::default());
    let plan = |_, _, _| Action::Sleep(Duration::from_millis(20));
    let config = config(3, 2);

    let report = start_simulation(builder(plan, &tally, &[]), 20, strategy(&config), config)
        .await
        .unwrap();

    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.rounds_completed, 2);
    assert_eq!(tally.built(), 40);
    assert_eq!(tally.dropped(), 40);
    assert!(tally.peak_live() <= 3, "peak was {}", tally.peak_live());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_acquisition_is_released_after_failures_and_timeouts() {
    let tally = Arc::new(Tally::default());
    let plan = |kind: TaskKind, _, id: usize| match (kind, id) {
        (TaskKind::Fit, 0..=2) => Action::Fail,
        (TaskKind::Fit, 3) => Action::Panic,
        (TaskKind::Fit, 4) => Action::Sleep(Duration::from_secs(1)),
        _ => Action::Succeed,
    };

    let config = SessionConfig {
        round_timeout_secs: Some(0.3),
        min_fit_participants: 5,
        ..config(10, 1)
    };

    let registry = Arc::new(ParticipantRegistry::new(config.seed));
    for i in 0..10_usize {
        registry.register(ParticipantId::from(i));
    }

    let factory = Arc::new(
        ParticipantFactory::new(
            builder(plan, &tally, &[]),
            &config.resource_budget(),
            config.participant_demand(),
        )
        .unwrap(),
    );

    let strategy = strategy(&config);
    let orchestrator =
        RoundOrchestrator::new(config, registry, Arc::clone(&factory), strategy).unwrap();
    let report = orchestrator.run().await;

    assert!(report.is_completed(), "{:?}", report.status);
    let fit = &report.history.rounds[0].fit;
    assert_eq!(fit.selected, 10);
    assert_eq!(fit.successes, 5);

    let failed: Vec<&str> = fit.failures.iter().map(|f| f.participant.as_str()).collect();
    assert_eq!(failed, ["0", "1", "2", "3", "4"]);
    assert_eq!(fit.failures[4].reason, "timed out");

    // The slow participant is still running when the round gives up on it.
    time::timeout(Duration::from_secs(5), factory.pool().drained())
        .await
        .unwrap();

    let pool = factory.pool();
    assert_eq!(pool.total_acquired(), 10);
    assert_eq!(pool.total_released(), 10);
    assert_eq!(tally.built(), tally.dropped());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_construction_gives_units_back() {
    let tally = Arc::new(Tally::default());
    let plan = |_, _, _| Action::Succeed;
    let config = SessionConfig {
        min_fit_participants: 3,
        ..config(1, 1)
    };

    let report = start_simulation(
        builder(plan, &tally, &[0, 1, 2, 3]),
        8,
        strategy(&config),
        config,
    )
    .await
    .unwrap();

    assert!(report.is_completed(), "{:?}", report.status);

    let fit = &report.history.rounds[0].fit;
    assert_eq!(fit.successes, 4);
    assert_eq!(fit.failures.len(), 4);
    assert!(
        fit.failures
            .iter()
            .all(|f| f.reason.starts_with("instantiation failed"))
    );
    assert_eq!(tally.built(), 4);
    assert_eq!(tally.dropped(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_resource_budgets_bound_concurrency_by_the_scarcest_unit() {
    let tally = Arc::new(Tally::default());
    let plan = |_, _, _| Action::Sleep(Duration::from_millis(20));
    let config = SessionConfig {
        resource_budget: ResourceSpec::Units(
            [("cpus".to_string(), 8), ("gpus".to_string(), 2)].into(),
        ),
        participant_resources: Some([("cpus".to_string(), 2), ("gpus".to_string(), 1)].into()),
        ..config(0, 1)
    };

    let report = start_simulation(builder(plan, &tally, &[]), 12, strategy(&config), config)
        .await
        .unwrap();

    assert!(report.is_completed(), "{:?}", report.status);
    assert_eq!(tally.built(), 12);
    assert!(tally.peak_live() <= 2, "peak was {}", tally.peak_live());
}
