mod common;

use std::sync::{Arc, Mutex};

use rand::SeedableRng;

use common::{action_grid, params, router_with, sample_context, FlakyOps};
use danci_decision::router::{BanditOperation, CircuitBreaker, CircuitState, ManualClock};
use danci_decision::{
    BanditRng, CircuitBreakerConfig, ContextualBanditModel, ExecutionRouter, ParallelOps,
};

#[test]
fn small_batches_always_use_reference() {
    let clock = Arc::new(ManualClock::new(0));
    let ops = Arc::new(FlakyOps::default());
    let (router, breaker) = router_with(ops.clone(), clock);
    let mut rng = BanditRng::seed_from_u64(1);

    for _ in 0..5 {
        assert_eq!(router.batch_sample(&mut rng, &params(10)).len(), 10);
    }
    breaker.force_open("maintenance");
    assert_eq!(router.batch_sample(&mut rng, &params(10)).len(), 10);
    breaker.reset();
    assert_eq!(router.batch_sample(&mut rng, &params(10)).len(), 10);

    let (fast, reference) = router.smart_router().route_counts(BanditOperation::BatchSample);
    assert_eq!((fast, reference), (0, 7));
    assert_eq!(ops.calls(), 0);
}

#[test]
fn breaker_trips_at_half_failures() {
    let clock = Arc::new(ManualClock::new(1_000));
    let breaker = CircuitBreaker::with_clock(CircuitBreakerConfig::default(), clock.clone());

    for _ in 0..10 {
        breaker.record_success();
    }
    for i in 0..9 {
        breaker.record_failure(format!("failure {i}"));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
    breaker.record_failure("failure 9");
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.can_execute());

    clock.advance(59_999);
    assert!(!breaker.can_execute());
    clock.advance(1);
    assert!(breaker.can_execute());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.can_execute());
}

#[test]
fn router_recovers_after_cooldown() {
    let clock = Arc::new(ManualClock::new(0));
    let ops = Arc::new(FlakyOps::failing());
    let (router, breaker) = router_with(ops.clone(), clock.clone());
    let mut rng = BanditRng::seed_from_u64(2);

    for _ in 0..10 {
        let out = router.batch_sample(&mut rng, &params(64));
        assert_eq!(out.len(), 64);
        assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(router.fallback_count(BanditOperation::BatchSample), 10);

    // open: the accelerator is not called at all
    router.batch_sample(&mut rng, &params(64));
    assert_eq!(ops.calls(), 10);

    ops.set_failing(false);
    clock.advance(60_000);
    router.batch_sample(&mut rng, &params(64));
    assert_eq!(ops.calls(), 11);
    assert_eq!(breaker.state(), CircuitState::Closed);

    let stats = router.stats();
    let batch = stats
        .operations
        .iter()
        .find(|s| s.operation == BanditOperation::BatchSample)
        .unwrap();
    assert_eq!((batch.fast, batch.reference, batch.fallbacks), (11, 1, 10));
}

#[test]
fn failed_half_open_probe_reopens() {
    let clock = Arc::new(ManualClock::new(0));
    let ops = Arc::new(FlakyOps::failing());
    let (router, breaker) = router_with(ops.clone(), clock.clone());
    let mut rng = BanditRng::seed_from_u64(3);

    for _ in 0..10 {
        router.batch_sample(&mut rng, &params(50));
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    let first_open = breaker.snapshot().opened_at_ms;

    clock.advance(60_000);
    router.batch_sample(&mut rng, &params(50));
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_ne!(breaker.snapshot().opened_at_ms, first_open);
    assert!(!breaker.can_execute());
}

#[test]
fn state_changes_reach_listeners() {
    let clock = Arc::new(ManualClock::new(0));
    let ops = Arc::new(FlakyOps::failing());
    let (router, breaker) = router_with(ops.clone(), clock.clone());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    breaker.on_state_change(move |change| {
        sink.lock().unwrap().push((change.from, change.to));
    });

    let mut rng = BanditRng::seed_from_u64(4);
    for _ in 0..10 {
        router.batch_sample(&mut rng, &params(80));
    }
    ops.set_failing(false);
    clock.advance(60_000);
    router.batch_sample(&mut rng, &params(80));

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
}

#[test]
fn bandit_scores_large_action_sets_on_accelerated_path() {
    let router = Arc::new(ExecutionRouter::default().with_accelerated(Arc::new(ParallelOps::new())));
    let mut model = ContextualBanditModel::with_seed(9, Arc::clone(&router));
    let actions = action_grid(30);
    let ctx = sample_context();

    for _ in 0..5 {
        let sel = model.select_action(&actions, &ctx).unwrap();
        assert!(actions.contains(&sel.action));
    }
    // below the threshold scoring stays on the reference path
    model.select_action(&actions[..5], &ctx).unwrap();

    let (fast, reference) = router.smart_router().route_counts(BanditOperation::ScoreActions);
    assert_eq!((fast, reference), (5, 1));
    assert_eq!(router.breaker().state(), CircuitState::Closed);
}

#[test]
fn concurrent_callers_share_one_breaker() {
    let clock = Arc::new(ManualClock::new(0));
    let ops = Arc::new(FlakyOps::failing());
    let (router, breaker) = router_with(ops, clock);

    std::thread::scope(|scope| {
        for seed in 0..8u64 {
            let router = Arc::clone(&router);
            scope.spawn(move || {
                let mut rng = BanditRng::seed_from_u64(seed);
                for _ in 0..10 {
                    let out = router.batch_sample(&mut rng, &params(60));
                    assert_eq!(out.len(), 60);
                }
            });
        }
    });

    assert_eq!(breaker.state(), CircuitState::Open);
    let (fast, reference) = router.smart_router().route_counts(BanditOperation::BatchSample);
    assert_eq!(fast + reference, 80);
    assert_eq!(router.fallback_count(BanditOperation::BatchSample), fast);
}
